//! Inbound sync endpoint.
//!
//! * `POST /sync` – merge the caller's state, answer with ours.
//! * `GET /` – full state, for debugging.
//! * `GET /health` – liveness.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::StoreError;
use crate::node::Node;
use crate::types::SyncRequest;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/", get(state))
        .route("/sync", post(sync))
        .route("/health", get(|| async { "ok" }))
        .with_state(node)
}

async fn state(State(node): State<Arc<Node>>) -> Response {
    Json(node.state_view().await).into_response()
}

async fn sync(State(node): State<Arc<Node>>, Json(request): Json<SyncRequest>) -> Response {
    let sender = request.sender.clone().unwrap_or_else(|| "unknown peer".into());
    match node.handle_sync(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e @ StoreError::NamespaceMismatch { .. }) => {
            warn!("Refusing sync from {}: {}", sender, e);
            (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e @ StoreError::SelfSync) => {
            debug!("Refusing sync from {}: {}", sender, e);
            (StatusCode::LOOP_DETECTED, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => {
            warn!("Sync from {} failed: {}", sender, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Serve until `shutdown` fires.
pub async fn serve(
    node: Arc<Node>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("Sync endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::node::tests::test_node;
    use crate::sync::{HttpTransport, Transport};
    use crate::types::StateView;
    use std::time::Duration;

    async fn spawn(node: Arc<Node>) -> (String, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(node, listener, rx));
        (url, tx)
    }

    #[tokio::test]
    async fn http_exchange_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(test_node(dir.path(), "alpha", "test", "fd00::1"));
        let b = test_node(dir.path(), "beta", "test", "fd00::2");
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        let (url, _guard) = spawn(Arc::clone(&a)).await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport.exchange(&url, &b.sync_request().await).await.unwrap();
        assert_eq!(response.records.len(), 2);
        b.apply_response(&url, response).await.unwrap();
        assert_eq!(a.snapshot().await, b.snapshot().await);

        let view: StateView = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(view.records.len(), 2);
        assert_eq!(view.peers, vec![b.url().to_string()]);
    }

    #[tokio::test]
    async fn foreign_namespace_gets_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(test_node(dir.path(), "alpha", "test", "fd00::1"));
        let b = test_node(dir.path(), "beta", "other", "fd00::2");
        b.initialize().await.unwrap();
        let (url, _guard) = spawn(Arc::clone(&a)).await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let err = transport.exchange(&url, &b.sync_request().await).await.unwrap_err();
        assert!(matches!(err, SyncError::NamespaceMismatch { .. }));
        assert!(a.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn own_request_is_refused_as_loop() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(test_node(dir.path(), "alpha", "test", "fd00::1"));
        a.initialize().await.unwrap();
        let (url, _guard) = spawn(Arc::clone(&a)).await;
        let alias = url.replace("127.0.0.1", "localhost");

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let err = transport.exchange(&alias, &a.sync_request().await).await.unwrap_err();
        assert!(matches!(err, SyncError::SelfPeer(ref p) if p == &alias));
        assert!(a.peers().lock().await.is_empty());
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let b = test_node(dir.path(), "beta", "test", "fd00::2");
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let err = transport.exchange(&url, &b.sync_request().await).await.unwrap_err();
        assert!(matches!(err, SyncError::PeerUnreachable(..)));
    }
}
