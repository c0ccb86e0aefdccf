//! Swarm resolution: mapping a session identity to the storage nodes that
//! hold its messages.
//!
//! Resolution order is cache, then database, then network discovery via a
//! `get_snodes_for_pubkey` RPC proxied through the bootstrap pool.  Discovery
//! is quorum-guarded: a swarm smaller than [`MIN_SWARM_COUNT`] is retried a
//! bounded number of times before the resolver settles for what it has.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use serde_json::{json, Value};

use crate::gwlog;
use crate::logging::session_tag;
use crate::proxy::proxy_rpc;
use crate::snode::{port_from_value, PeerPool, SnodeTarget};
use crate::storage::Store;

/// A swarm below this size is treated as an incomplete discovery result.
pub const MIN_SWARM_COUNT: usize = 2;

/// How many swarm members a retrieval round targets.
pub const TARGET_SNODE_COUNT: usize = 3;

/// Discovery attempts before accepting an undersized swarm.
pub const SWARM_RETRY_LIMIT: usize = 5;

/// Resolves and caches the swarm for each session identity.
pub struct SwarmResolver {
    store: Store,
    pool: Arc<PeerPool>,
    agent: ureq::Agent,
    cache: Mutex<HashMap<String, Vec<SnodeTarget>>>,
}

impl SwarmResolver {
    pub fn new(store: Store, pool: Arc<PeerPool>, agent: ureq::Agent) -> Self {
        Self {
            store,
            pool,
            agent,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The full known swarm for an identity: cache, then database, then one
    /// round of network discovery.  May return fewer than
    /// [`MIN_SWARM_COUNT`] entries; callers wanting a quorum retry via
    /// [`target_snodes`].
    pub fn get_swarm(&self, session_id: &str) -> Vec<SnodeTarget> {
        if let Some(cached) = self.cache.lock().unwrap().get(session_id) {
            if !cached.is_empty() {
                return cached.clone();
            }
        }

        match self.store.swarm_for(session_id) {
            Ok(persisted) if !persisted.is_empty() => {
                self.cache
                    .lock()
                    .unwrap()
                    .insert(session_id.to_string(), persisted.clone());
                return persisted;
            }
            Ok(_) => {}
            Err(error) => {
                gwlog!(
                    "swarm: failed to load persisted swarm for {}: {error}",
                    session_tag(session_id)
                );
            }
        }

        let discovered = self.discover(session_id);
        if !discovered.is_empty() {
            if let Err(error) = self.store.save_swarm(session_id, &discovered) {
                gwlog!(
                    "swarm: failed to persist swarm for {}: {error}",
                    session_tag(session_id)
                );
            }
            self.cache
                .lock()
                .unwrap()
                .insert(session_id.to_string(), discovered.clone());
        }
        discovered
    }

    /// Up to [`TARGET_SNODE_COUNT`] random swarm members for a retrieval
    /// round.  Retries discovery until the swarm reaches quorum or the retry
    /// budget runs out, then returns whatever exists; an empty result means
    /// "no data this cycle", not an error.
    ///
    /// A cached or persisted swarm below quorum does not satisfy a retry:
    /// each attempt re-runs network discovery and accumulates any members
    /// it finds, so a stale sub-quorum snapshot cannot pin the identity.
    pub fn target_snodes(&self, session_id: &str) -> Vec<SnodeTarget> {
        let mut swarm = self.get_swarm(session_id);
        let known = swarm.len();
        let mut attempts = 1;
        while swarm.len() < MIN_SWARM_COUNT && attempts < SWARM_RETRY_LIMIT {
            for member in self.discover(session_id) {
                if !swarm.contains(&member) {
                    swarm.push(member);
                }
            }
            attempts += 1;
        }
        if swarm.len() > known {
            if let Err(error) = self.store.save_swarm(session_id, &swarm) {
                gwlog!(
                    "swarm: failed to persist swarm for {}: {error}",
                    session_tag(session_id)
                );
            }
            self.cache
                .lock()
                .unwrap()
                .insert(session_id.to_string(), swarm.clone());
        }
        let mut rng = rand::thread_rng();
        swarm.shuffle(&mut rng);
        swarm.truncate(TARGET_SNODE_COUNT);
        swarm
    }

    /// Drop the cached swarm so the next lookup re-resolves.  Called when a
    /// retrieval round finds every cached member unresponsive.
    pub fn invalidate(&self, session_id: &str) {
        self.cache.lock().unwrap().remove(session_id);
    }

    fn discover(&self, session_id: &str) -> Vec<SnodeTarget> {
        let Some(target) = self.pool.pick_one() else {
            gwlog!("swarm: pool is empty, cannot discover for {}", session_tag(session_id));
            return Vec::new();
        };
        let Some(proxy) = self.pool.pick_one_excluding(&target) else {
            gwlog!("swarm: no distinct proxy peer available");
            return Vec::new();
        };

        let params = json!({ "pubKey": session_id });
        let Some(response) = proxy_rpc(
            &self.agent,
            &proxy,
            &target,
            "get_snodes_for_pubkey",
            &params,
        ) else {
            return Vec::new();
        };

        let swarm = parse_swarm(&response);
        gwlog!(
            "swarm: discovered {} member(s) for {}",
            swarm.len(),
            session_tag(session_id)
        );
        swarm
    }
}

/// Extract swarm members from a `get_snodes_for_pubkey` response body.
/// Placeholder addresses are dropped; ports arrive as numbers or strings.
fn parse_swarm(response: &Value) -> Vec<SnodeTarget> {
    let Some(snodes) = response
        .pointer("/body")
        .and_then(Value::as_str)
        .and_then(|body| serde_json::from_str::<Value>(body).ok())
        .map(|body| body.get("snodes").cloned().unwrap_or(Value::Null))
        .or_else(|| response.get("snodes").cloned())
    else {
        return Vec::new();
    };
    let Some(entries) = snodes.as_array() else {
        return Vec::new();
    };

    let mut swarm = Vec::new();
    for entry in entries {
        let host = entry.get("ip").and_then(Value::as_str).unwrap_or("");
        let port = entry.get("port").and_then(port_from_value);
        let id_key = entry
            .get("pubkey_ed25519")
            .and_then(Value::as_str)
            .unwrap_or("");
        let enc_key = entry
            .get("pubkey_x25519")
            .and_then(Value::as_str)
            .unwrap_or("");
        let Some(port) = port else { continue };
        if let Some(target) = SnodeTarget::from_descriptor(host, port, id_key, enc_key) {
            swarm.push(target);
        }
    }
    swarm
}
