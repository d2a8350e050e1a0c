use anyhow::Context;
use clap::Parser;
use lbnet::config::{Args, Config, XsyncTransport};
use lbnet::dp::{Datapath, DpBroker, StubDatapath};
use lbnet::probe::EpCheckers;
use lbnet::ticker::Ticker;
use lbnet::xsync::{READY_POLL, Xsync, XsyncServer, spawn_announcer};
use lbnet::zone::ZoneH;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let cfg = Config::from_args(&args);

    let level = cfg
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = match cfg {
        Ok(c) => c,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg).await {
        error!(error = %format!("{e:#}"), "lbnet failed");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    info!(
        node_id = cfg.node_id,
        peers = cfg.cluster_nodes.len(),
        "Starting lbnet"
    );

    let dp: Arc<dyn Datapath> = Arc::new(StubDatapath::new());
    let (broker, handle, completions) =
        DpBroker::spawn(Arc::clone(&dp), cfg.dp_queue_len, cfg.dp_batch)
            .context("starting datapath broker")?;

    let zh = Arc::new(ZoneH::new(handle, cfg.rule_config()).context("creating root zone")?);
    let ticker = Ticker::start(Arc::clone(&zh), completions, cfg.tick());
    let checkers = EpCheckers::start(Arc::clone(&zh), cfg.ep_checkers, cfg.ep_check_period());

    let xsync = match cfg.xsync_transport {
        XsyncTransport::Http => {
            let xs = Arc::new(Xsync::new(Arc::clone(&dp), cfg.node_id));
            let server = XsyncServer::start(Arc::clone(&xs), cfg.xsync_addr())
                .await
                .context("starting xsync server")?;
            for peer in cfg.peer_addrs() {
                xs.peer_add(peer)
                    .with_context(|| format!("adding xsync peer {peer}"))?;
            }
            xs.set_ready(true);
            let announcer = spawn_announcer(Arc::clone(&xs), READY_POLL);
            Some((xs, server, announcer))
        }
        XsyncTransport::None => {
            info!("Connection-tracking replication disabled");
            None
        }
    };

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to set up SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to set up SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    if let Some((xs, server, announcer)) = xsync {
        xs.set_ready(false);
        announcer.abort();
        server.stop().await;
    }
    checkers.stop();
    ticker.stop().await;
    if let Err(e) = broker.join() {
        warn!(error = %e, "Datapath broker did not stop cleanly");
    }

    info!("Shutdown complete");
    Ok(())
}
