//! Webhook server
//!
//! Serves the admission webhook over plain HTTP. TLS is terminated in front
//! of the operator pod.

use super::webhook::{validate_handler, VALIDATE_PATH};
use crate::error::{Error, Result};
use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Configuration of the webhook server
#[derive(Debug, Clone)]
pub struct WebhookServerConfig {
    pub addr: SocketAddr,
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9443)),
        }
    }
}

/// Admission webhook HTTP server
pub struct WebhookServer {
    config: WebhookServerConfig,
    shutdown: CancellationToken,
}

impl WebhookServer {
    pub fn new(config: WebhookServerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Routes served by the webhook
    pub fn router() -> Router {
        Router::new()
            .route(VALIDATE_PATH, post(validate_handler))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until [`WebhookServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind webhook server: {}", e)))?;
        info!(addr = %self.config.addr, "Webhook server listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, Self::router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Webhook server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("Webhook server error: {}", e)))
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        assert_eq!(WebhookServerConfig::default().addr.port(), 9443);
    }

    #[tokio::test]
    async fn test_router_serves_validation() {
        use axum::body::{to_bytes, Body};
        use axum::http::{Method, Request, StatusCode};
        use tower::ServiceExt;

        let review = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "uid-1",
                "kind": {"group": "hostpathprovisioner.kubevirt.io", "version": "v1beta1", "kind": "HostPathProvisioner"},
                "resource": {"group": "hostpathprovisioner.kubevirt.io", "version": "v1beta1", "resource": "hostpathprovisioners"},
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "hostpathprovisioner.kubevirt.io/v1beta1",
                    "kind": "HostPathProvisioner",
                    "metadata": {"name": "hostpath-provisioner"},
                    "spec": {"pathConfig": {"path": "/var/hpvolumes"}}
                }
            }
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri(VALIDATE_PATH)
            .header("content-type", "application/json")
            .body(Body::from(review.to_string()))
            .unwrap();

        let response = WebhookServer::router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let out: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(out["response"]["uid"], "uid-1");
        assert_eq!(out["response"]["allowed"], true);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let server = std::sync::Arc::new(WebhookServer::new(WebhookServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }));
        let running = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        server.shutdown();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
