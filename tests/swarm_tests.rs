//! Swarm resolution behavior against a local seed endpoint: sub-quorum
//! retry and cache invalidation after a dead fetch round.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use swarmgate::fetch::MessageFetcher;
use swarmgate::snode::{storage_agent, PeerPool, SnodeTarget};
use swarmgate::storage::Store;
use swarmgate::swarm::SwarmResolver;

fn temp_store(tag: &str) -> Store {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("swarmgate-swarm-it-{tag}-{nanos}.db"));
    Store::open(&path).unwrap()
}

fn member(host: &str, port: u16) -> SnodeTarget {
    SnodeTarget {
        host: host.to_string(),
        port,
        id_key: format!("ed-{host}"),
        encryption_key: format!("x-{host}"),
    }
}

/// Seed endpoint that counts hits and advertises two local nodes whose
/// storage ports are closed, so proxied RPCs fail fast.
async fn serve_seed(hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().route(
        "/json_rpc",
        post(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(json!({
                    "result": {
                        "service_node_states": [
                            { "public_ip": "127.0.0.1", "storage_port": 9,
                              "pubkey_ed25519": "ed-a", "pubkey_x25519": "x-a" },
                            { "public_ip": "127.0.0.1", "storage_port": 10,
                              "pubkey_ed25519": "ed-b", "pubkey_x25519": "x-b" }
                        ]
                    }
                }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn subquorum_swarm_retries_discovery_instead_of_sticking() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = serve_seed(Arc::clone(&hits)).await;

    let store = temp_store("subquorum");
    // A persisted single-member swarm: below quorum, must not satisfy the
    // retry loop on its own.
    let persisted = member("203.0.113.1", 443);
    store.save_swarm("identity", std::slice::from_ref(&persisted)).unwrap();

    let agent = storage_agent().unwrap();
    let pool = Arc::new(PeerPool::with_seeds(
        store.clone(),
        agent.clone(),
        vec![format!("http://{addr}")],
    ));
    let resolver = Arc::new(SwarmResolver::new(store, pool, agent));

    let r = Arc::clone(&resolver);
    let targets = tokio::task::spawn_blocking(move || r.target_snodes("identity"))
        .await
        .unwrap();

    // Discovery ran: the pool bootstrapped from the seed during the retry.
    assert!(hits.load(Ordering::SeqCst) >= 1);
    // The known member is kept even though re-discovery found nothing new.
    assert_eq!(targets, vec![persisted]);
}

#[tokio::test]
async fn unanswered_fetch_round_invalidates_cached_swarm() {
    let store = temp_store("invalidate");
    let agent = storage_agent().unwrap();
    let pool = Arc::new(PeerPool::with_seeds(store.clone(), agent.clone(), Vec::new()));
    let resolver = Arc::new(SwarmResolver::new(
        store.clone(),
        Arc::clone(&pool),
        agent.clone(),
    ));
    let fetcher = MessageFetcher::new(store.clone(), pool, Arc::clone(&resolver), agent);

    // Quorum-sized swarm so resolution needs no discovery; warm the cache.
    let stale = vec![member("192.0.2.1", 443), member("192.0.2.2", 443)];
    store.save_swarm("identity", &stale).unwrap();
    let r = Arc::clone(&resolver);
    let warmed = tokio::task::spawn_blocking(move || r.get_swarm("identity"))
        .await
        .unwrap();
    assert_eq!(warmed, stale);

    // The database moves on, but the cached copy still wins.
    let fresh = vec![member("198.51.100.1", 443)];
    store.save_swarm("identity", &fresh).unwrap();
    let r = Arc::clone(&resolver);
    let cached = tokio::task::spawn_blocking(move || r.get_swarm("identity"))
        .await
        .unwrap();
    assert_eq!(cached, stale);

    // No proxy peers exist, so the round ends with zero answers for the
    // identity; that must drop the cache entry.
    let fetched = fetcher.fetch_messages(vec!["identity".to_string()]).await;
    assert!(fetched.is_empty());

    let r = Arc::clone(&resolver);
    let after = tokio::task::spawn_blocking(move || r.get_swarm("identity"))
        .await
        .unwrap();
    assert_eq!(after, fresh);
}
