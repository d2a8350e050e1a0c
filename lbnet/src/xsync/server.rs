//! HTTP side of xsync.

use super::{CtGet, CtInfo, Result, Xsync, XsyncError, XsyncReply};
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

type Reply = (StatusCode, Json<XsyncReply>);

fn reply(res: Result<i32>) -> Reply {
    match res {
        Ok(status) => (StatusCode::OK, Json(XsyncReply { status, error: None })),
        Err(e) => {
            let code = match e {
                XsyncError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                code,
                Json(XsyncReply {
                    status: -1,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn ct_add(State(xs): State<Arc<Xsync>>, Json(ct): Json<CtInfo>) -> impl IntoResponse {
    reply(xs.ct_add(&ct))
}

async fn ct_delete(State(xs): State<Arc<Xsync>>, Json(ct): Json<CtInfo>) -> impl IntoResponse {
    reply(xs.ct_delete(&ct))
}

async fn block_ct_add(
    State(xs): State<Arc<Xsync>>,
    Json(cts): Json<Vec<CtInfo>>,
) -> impl IntoResponse {
    reply(xs.block_ct_add(&cts))
}

async fn block_ct_delete(
    State(xs): State<Arc<Xsync>>,
    Json(cts): Json<Vec<CtInfo>>,
) -> impl IntoResponse {
    reply(xs.block_ct_delete(&cts))
}

async fn ct_get(State(xs): State<Arc<Xsync>>, Json(req): Json<CtGet>) -> impl IntoResponse {
    reply(xs.ct_get(req))
}

pub fn router(xs: Arc<Xsync>) -> Router {
    Router::new()
        .route("/xsync/v1/ct/add", post(ct_add))
        .route("/xsync/v1/ct/delete", post(ct_delete))
        .route("/xsync/v1/ct/block/add", post(block_ct_add))
        .route("/xsync/v1/ct/block/delete", post(block_ct_delete))
        .route("/xsync/v1/ct/get", post(ct_get))
        .with_state(xs)
}

/// Running xsync listener.
pub struct XsyncServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl XsyncServer {
    pub async fn start(xs: Arc<Xsync>, listen: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| XsyncError::Server(format!("bind {listen}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| XsyncError::Server(e.to_string()))?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = router(xs);
        let task = tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = res {
                error!(error = %e, "Xsync server failed");
            }
        });

        info!(%addr, "Xsync server listening");
        Ok(Self {
            addr,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
        info!(addr = %self.addr, "Xsync server stopped");
    }
}
