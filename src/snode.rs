//! Storage-node targets and the bootstrap peer pool.
//!
//! A [`SnodeTarget`] identifies one storage node: a secured address plus its
//! two public keys (ed25519 identity key, x25519 encryption key).  The
//! [`PeerPool`] is the bootstrap/fallback set of known nodes used whenever no
//! swarm is cached for an identity yet; it refills from the database or, when
//! that is empty too, from a fixed list of seed endpoints.

use std::sync::Mutex;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::{json, Value};

use crate::gwlog;
use crate::storage::Store;

/// Upper bound on the bootstrap pool, and the `limit` sent to seed nodes.
pub const MAX_POOL_SIZE: usize = 1024;

/// Timeout applied to every storage-network RPC.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

const SEED_ENDPOINTS: &[&str] = &[
    "http://storage.seed1.loki.network:22023",
    "http://storage.seed2.loki.network:38157",
    "http://149.56.148.124:38157",
];

/// One storage-network node. Immutable value; produced by discovery
/// responses and by the database, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnodeTarget {
    pub host: String,
    pub port: u16,
    /// ed25519 identity key, hex.
    pub id_key: String,
    /// x25519 encryption key, hex.
    pub encryption_key: String,
}

impl SnodeTarget {
    /// Build a target from a discovery descriptor, rejecting placeholder
    /// addresses (`0.0.0.0` or empty) that some nodes advertise.
    pub fn from_descriptor(
        host: &str,
        port: u16,
        id_key: &str,
        encryption_key: &str,
    ) -> Option<Self> {
        if host.is_empty() || host == "0.0.0.0" {
            return None;
        }
        if id_key.is_empty() || encryption_key.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
            id_key: id_key.to_string(),
            encryption_key: encryption_key.to_string(),
        })
    }

    pub fn proxy_url(&self) -> String {
        format!("https://{}:{}/proxy", self.host, self.port)
    }
}

/// Ports arrive as JSON numbers or strings depending on the peer.
pub(crate) fn port_from_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// HTTP agent for talking to storage nodes and seed endpoints.
///
/// Storage nodes serve self-signed certificates, so certificate verification
/// is disabled; confidentiality against the node itself comes from the
/// request cipher in [`crate::proxy`], not from TLS.
pub fn storage_agent() -> Result<ureq::Agent, native_tls::Error> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    Ok(ureq::AgentBuilder::new()
        .timeout(RPC_TIMEOUT)
        .tls_connector(std::sync::Arc::new(tls))
        .build())
}

#[derive(Debug)]
pub enum DiscoveryError {
    Http(String),
    Malformed(&'static str),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::Http(e) => write!(f, "seed http error: {e}"),
            DiscoveryError::Malformed(what) => write!(f, "malformed seed response: {what}"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// In-memory bootstrap set of storage nodes, backed by the database.
pub struct PeerPool {
    store: Store,
    agent: ureq::Agent,
    seeds: Vec<String>,
    pool: Mutex<Vec<SnodeTarget>>,
}

impl PeerPool {
    pub fn new(store: Store, agent: ureq::Agent) -> Self {
        Self::with_seeds(
            store,
            agent,
            SEED_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn with_seeds(store: Store, agent: ureq::Agent, seeds: Vec<String>) -> Self {
        Self {
            store,
            agent,
            seeds,
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill the pool from the database, or from a random seed endpoint when
    /// nothing is persisted.  Fails soft: on discovery error the pool stays
    /// empty and callers retry on a later cycle.
    pub fn bootstrap(&self) {
        if !self.is_empty() {
            return;
        }

        match self.store.snode_pool() {
            Ok(persisted) if !persisted.is_empty() => {
                *self.pool.lock().unwrap() = persisted;
                return;
            }
            Ok(_) => {}
            Err(error) => gwlog!("pool: failed to load persisted snodes: {error}"),
        }

        let seed = {
            let mut rng = rand::thread_rng();
            match self.seeds.choose(&mut rng) {
                Some(seed) => seed.clone(),
                None => return,
            }
        };
        match self.discover_from_seed(&seed) {
            Ok(mut peers) => {
                peers.truncate(MAX_POOL_SIZE);
                gwlog!("pool: discovered {} snode(s) from {seed}", peers.len());
                if let Err(error) = self.store.save_snode_pool(&peers) {
                    gwlog!("pool: failed to persist snodes: {error}");
                }
                *self.pool.lock().unwrap() = peers;
            }
            Err(error) => gwlog!("pool: seed discovery via {seed} failed: {error}"),
        }
    }

    /// Uniform sample of `n` distinct peers; bootstraps first when empty.
    pub fn pick_random(&self, n: usize) -> Vec<SnodeTarget> {
        self.bootstrap();
        let pool = self.pool.lock().unwrap();
        let mut rng = rand::thread_rng();
        pool.choose_multiple(&mut rng, n).cloned().collect()
    }

    pub fn pick_one(&self) -> Option<SnodeTarget> {
        self.pick_random(1).into_iter().next()
    }

    /// Random peer that is not `excluded`.  Used to select a proxy hop:
    /// proxying a request through its own target would defeat the purpose.
    pub fn pick_one_excluding(&self, excluded: &SnodeTarget) -> Option<SnodeTarget> {
        self.bootstrap();
        let pool = self.pool.lock().unwrap();
        let candidates: Vec<&SnodeTarget> = pool.iter().filter(|t| *t != excluded).collect();
        let mut rng = rand::thread_rng();
        candidates.choose(&mut rng).map(|t| (*t).clone())
    }

    fn discover_from_seed(&self, seed: &str) -> Result<Vec<SnodeTarget>, DiscoveryError> {
        let request = json!({
            "method": "get_n_service_nodes",
            "params": {
                "active_only": true,
                "limit": MAX_POOL_SIZE,
                "fields": {
                    "public_ip": true,
                    "storage_port": true,
                    "pubkey_ed25519": true,
                    "pubkey_x25519": true
                }
            }
        });
        let response = self
            .agent
            .post(&format!("{seed}/json_rpc"))
            .send_json(request)
            .map_err(|e| DiscoveryError::Http(e.to_string()))?;
        let body: Value = response
            .into_json()
            .map_err(|e| DiscoveryError::Http(e.to_string()))?;

        let states = body
            .pointer("/result/service_node_states")
            .and_then(Value::as_array)
            .ok_or(DiscoveryError::Malformed("missing service_node_states"))?;

        let mut peers = Vec::new();
        for state in states {
            let host = state.get("public_ip").and_then(Value::as_str).unwrap_or("");
            let port = state.get("storage_port").and_then(port_from_value);
            let id_key = state
                .get("pubkey_ed25519")
                .and_then(Value::as_str)
                .unwrap_or("");
            let enc_key = state
                .get("pubkey_x25519")
                .and_then(Value::as_str)
                .unwrap_or("");
            let Some(port) = port else { continue };
            if let Some(target) = SnodeTarget::from_descriptor(host, port, id_key, enc_key) {
                peers.push(target);
            }
        }
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, port: u16) -> SnodeTarget {
        SnodeTarget::from_descriptor(host, port, "ed", "x").expect("valid target")
    }

    #[test]
    fn rejects_placeholder_addresses() {
        assert!(SnodeTarget::from_descriptor("0.0.0.0", 443, "ed", "x").is_none());
        assert!(SnodeTarget::from_descriptor("", 443, "ed", "x").is_none());
        assert!(SnodeTarget::from_descriptor("1.2.3.4", 443, "", "x").is_none());
        assert!(SnodeTarget::from_descriptor("1.2.3.4", 443, "ed", "x").is_some());
    }

    #[test]
    fn port_parses_from_number_or_string() {
        assert_eq!(port_from_value(&serde_json::json!(8080)), Some(8080));
        assert_eq!(port_from_value(&serde_json::json!("8080")), Some(8080));
        assert_eq!(port_from_value(&serde_json::json!(70000)), None);
        assert_eq!(port_from_value(&serde_json::json!(null)), None);
    }

    #[test]
    fn proxy_url_uses_https() {
        assert_eq!(target("1.2.3.4", 443).proxy_url(), "https://1.2.3.4:443/proxy");
    }
}
