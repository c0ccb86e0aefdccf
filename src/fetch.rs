//! Message retrieval across swarm members.
//!
//! A fetch round resolves up to three swarm members per identity, issues one
//! proxied `retrieve` RPC per (identity, member) pair with the identity's
//! stored cursor, and merges the answers.  Peers disagree routinely — a
//! member that has not yet replicated recent messages returns a shorter
//! list — so the merge keeps whichever answer reaches furthest into the
//! future.  Individual peer failures never fail the round.
//!
//! The underlying HTTP client blocks, so every RPC runs on the blocking
//! thread pool; a [`tokio::task::JoinSet`] fans the calls out and joins them
//! without ordering assumptions.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::gwlog;
use crate::logging::session_tag;
use crate::proxy::proxy_rpc;
use crate::snode::{PeerPool, SnodeTarget};
use crate::storage::Store;
use crate::swarm::SwarmResolver;

/// Bodies shorter than this are padding artifacts, not messages.
const MIN_DATA_LEN: usize = 3;

/// One stored message as returned by a swarm member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub hash: String,
    /// Absolute expiration, milliseconds since the Unix epoch.
    pub expiration: u64,
    /// Opaque ciphertext envelope, passed through to push payloads.
    pub data: String,
}

/// Expirations arrive as JSON numbers or decimal strings depending on the
/// peer's version.
pub(crate) fn expiration_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse the `messages` list out of a decrypted `retrieve` response.
/// Malformed entries and sub-minimum bodies are dropped.
pub(crate) fn parse_messages(response: &Value) -> Vec<Message> {
    let messages = response
        .pointer("/body")
        .and_then(Value::as_str)
        .and_then(|body| serde_json::from_str::<Value>(body).ok())
        .map(|body| body.get("messages").cloned().unwrap_or(Value::Null))
        .or_else(|| response.get("messages").cloned());
    let Some(entries) = messages.as_ref().and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries {
        let Some(hash) = entry.get("hash").and_then(Value::as_str) else {
            continue;
        };
        let Some(expiration) = entry.get("expiration").and_then(expiration_from_value) else {
            continue;
        };
        let Some(data) = entry.get("data").and_then(Value::as_str) else {
            continue;
        };
        if data.len() < MIN_DATA_LEN {
            continue;
        }
        out.push(Message {
            hash: hash.to_string(),
            expiration,
            data: data.to_string(),
        });
    }
    out
}

/// Merge one peer's answer into the running result for an identity: the
/// first non-empty list wins until a later list ends at a strictly greater
/// expiration.
pub(crate) fn merge_answer(current: &mut Vec<Message>, candidate: Vec<Message>) {
    if candidate.is_empty() {
        return;
    }
    if current.is_empty() {
        *current = candidate;
        return;
    }
    let current_last = current.last().map(|m| m.expiration).unwrap_or(0);
    let candidate_last = candidate.last().map(|m| m.expiration).unwrap_or(0);
    if candidate_last > current_last {
        *current = candidate;
    }
}

/// Source of new messages for a dispatch cycle.  The live implementation is
/// [`MessageFetcher`]; dispatch logic depends only on this seam.
pub trait MessageSource: Send + Sync {
    fn fetch_messages<'a>(
        &'a self,
        session_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = HashMap<String, Vec<Message>>> + Send + 'a>>;
}

/// Fetches new messages for a set of identities each dispatch cycle.
pub struct MessageFetcher {
    store: Store,
    pool: Arc<PeerPool>,
    resolver: Arc<SwarmResolver>,
    agent: ureq::Agent,
}

impl MessageFetcher {
    pub fn new(
        store: Store,
        pool: Arc<PeerPool>,
        resolver: Arc<SwarmResolver>,
        agent: ureq::Agent,
    ) -> Self {
        Self {
            store,
            pool,
            resolver,
            agent,
        }
    }

    /// Retrieve messages newer than each identity's cursor.
    ///
    /// Identities with no reachable swarm members simply have no entry in
    /// the result; the caller treats that as "nothing this cycle".
    pub async fn fetch_messages(
        &self,
        session_ids: Vec<String>,
    ) -> HashMap<String, Vec<Message>> {
        // Stage 1: resolve targets and cursors, concurrently per identity.
        let mut resolve_tasks = JoinSet::new();
        for session_id in session_ids {
            let resolver = Arc::clone(&self.resolver);
            let store = self.store.clone();
            resolve_tasks.spawn_blocking(move || {
                let targets = resolver.target_snodes(&session_id);
                let cursor = store.last_hash(&session_id).unwrap_or_else(|error| {
                    gwlog!(
                        "fetch: cursor load failed for {}: {error}",
                        session_tag(&session_id)
                    );
                    (String::new(), 0)
                });
                (session_id, cursor.0, targets)
            });
        }

        // Stage 2: one retrieve RPC per (identity, target), all concurrent.
        let mut rpc_tasks = JoinSet::new();
        let mut attempted = HashSet::new();
        while let Some(joined) = resolve_tasks.join_next().await {
            let Ok((session_id, last_hash, targets)) = joined else {
                continue;
            };
            if !targets.is_empty() {
                attempted.insert(session_id.clone());
            }
            for target in targets {
                let Some(proxy) = self.pool.pick_one_excluding(&target) else {
                    continue;
                };
                let agent = self.agent.clone();
                let session_id = session_id.clone();
                let last_hash = last_hash.clone();
                rpc_tasks.spawn_blocking(move || {
                    let answer = retrieve_from(&agent, &proxy, &target, &session_id, &last_hash);
                    (session_id, answer)
                });
            }
        }

        let mut merged: HashMap<String, Vec<Message>> = HashMap::new();
        let mut answered = HashSet::new();
        while let Some(joined) = rpc_tasks.join_next().await {
            let Ok((session_id, answer)) = joined else {
                continue;
            };
            let Some(messages) = answer else { continue };
            answered.insert(session_id.clone());
            merge_answer(merged.entry(session_id).or_default(), messages);
        }

        // An identity whose every target went unanswered may be holding a
        // stale swarm; drop the cache entry so the next round re-resolves.
        for session_id in attempted.difference(&answered) {
            gwlog!(
                "fetch: no swarm member answered for {}, invalidating",
                session_tag(session_id)
            );
            self.resolver.invalidate(session_id);
        }

        merged.retain(|_, messages| !messages.is_empty());
        merged
    }
}

impl MessageSource for MessageFetcher {
    fn fetch_messages<'a>(
        &'a self,
        session_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = HashMap<String, Vec<Message>>> + Send + 'a>> {
        Box::pin(MessageFetcher::fetch_messages(self, session_ids))
    }
}

/// One proxied `retrieve` against one swarm member; `None` when the peer is
/// unreachable or the response does not decode.
fn retrieve_from(
    agent: &ureq::Agent,
    proxy: &SnodeTarget,
    target: &SnodeTarget,
    session_id: &str,
    last_hash: &str,
) -> Option<Vec<Message>> {
    let params = json!({ "pubKey": session_id, "lastHash": last_hash });
    let response = proxy_rpc(agent, proxy, target, "retrieve", &params)?;
    Some(parse_messages(&response))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(hash: &str, expiration: u64) -> Message {
        Message {
            hash: hash.to_string(),
            expiration,
            data: "ZW5jcnlwdGVk".to_string(),
        }
    }

    #[test]
    fn expiration_parses_from_number_or_string() {
        assert_eq!(expiration_from_value(&json!(1234)), Some(1234));
        assert_eq!(expiration_from_value(&json!("1234")), Some(1234));
        assert_eq!(expiration_from_value(&json!("soon")), None);
        assert_eq!(expiration_from_value(&json!(null)), None);
    }

    #[test]
    fn parse_drops_short_and_malformed_entries() {
        let inner = json!({
            "messages": [
                { "hash": "h1", "expiration": 100, "data": "ZW5jcnlwdGVk" },
                { "hash": "h2", "expiration": 200, "data": "ab" },
                { "hash": "h3", "data": "ZW5jcnlwdGVk" },
                { "expiration": 300, "data": "ZW5jcnlwdGVk" },
                { "hash": "h5", "expiration": "400", "data": "ZW5jcnlwdGVk" }
            ]
        });
        let response = json!({ "body": inner.to_string() });
        let parsed = parse_messages(&response);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].hash, "h1");
        assert_eq!(parsed[1].hash, "h5");
        assert_eq!(parsed[1].expiration, 400);
    }

    #[test]
    fn merge_prefers_furthest_expiration() {
        // Peer A's answer ends at 100, peer B's at 200: B wins.
        let mut current = Vec::new();
        merge_answer(&mut current, vec![msg("a1", 50), msg("a2", 100)]);
        merge_answer(&mut current, vec![msg("b1", 200)]);
        assert_eq!(current, vec![msg("b1", 200)]);

        // A later answer ending earlier does not replace the current one.
        merge_answer(&mut current, vec![msg("c1", 150)]);
        assert_eq!(current, vec![msg("b1", 200)]);

        // Ties keep the incumbent.
        merge_answer(&mut current, vec![msg("d1", 200)]);
        assert_eq!(current, vec![msg("b1", 200)]);

        // Empty answers never clobber.
        merge_answer(&mut current, Vec::new());
        assert_eq!(current, vec![msg("b1", 200)]);
    }
}
