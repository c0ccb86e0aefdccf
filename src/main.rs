use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use swarmgate::dispatch::{run_loop, NormalDispatcher, SilentDispatcher};
use swarmgate::fetch::MessageFetcher;
use swarmgate::gwlog;
use swarmgate::push::{ApnsBackend, FcmBackend, LoggingApns, LoggingFcm};
use swarmgate::snode::{storage_agent, PeerPool};
use swarmgate::storage::Store;
use swarmgate::swarm::SwarmResolver;
use swarmgate::web::{self, AppState};

/// Push-notification gateway bridging a swarm storage network to APNs/FCM.
#[derive(Parser, Debug)]
#[command(name = "swarmgate", version)]
struct Cli {
    /// Address for the registration HTTP server.
    #[arg(short, long, env = "SWARMGATE_BIND", default_value = "127.0.0.1:3000")]
    bind: String,

    /// Directory holding the gateway database.
    #[arg(short, long, env = "SWARMGATE_HOME", default_value = ".swarmgate")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let store = Store::open(&cli.data_dir.join("gateway.db"))?;
    let agent = storage_agent()?;
    let pool = Arc::new(PeerPool::new(store.clone(), agent.clone()));
    let resolver = Arc::new(SwarmResolver::new(
        store.clone(),
        Arc::clone(&pool),
        agent.clone(),
    ));
    let fetcher = Arc::new(MessageFetcher::new(
        store.clone(),
        Arc::clone(&pool),
        resolver,
        agent,
    ));

    // Log-only delivery until real APNs/FCM credentials are wired in.
    let apns: Arc<dyn ApnsBackend> = Arc::new(LoggingApns);
    let fcm: Arc<dyn FcmBackend> = Arc::new(LoggingFcm);

    let normal = Arc::new(NormalDispatcher::new(
        store.clone(),
        fetcher,
        Arc::clone(&apns),
        fcm,
    ));
    let silent = Arc::new(SilentDispatcher::new(store, apns));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let normal_task = tokio::spawn(run_loop(Arc::clone(&normal), shutdown_rx.clone()));
    let silent_task = tokio::spawn(run_loop(Arc::clone(&silent), shutdown_rx));

    let app = web::router(AppState { normal, silent });
    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    gwlog!("listening on {}", cli.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            gwlog!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = normal_task.await;
    let _ = silent_task.await;
    gwlog!("goodbye");
    Ok(())
}
