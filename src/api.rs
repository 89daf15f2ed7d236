//! Read-only HTTP API.
//!
//! Serves the registry's service snapshots as JSON:
//!
//! - `GET /services` lists every loaded service in load order
//! - `GET /services/{service}` returns one service, or 404
//!
//! The API listens on a unix socket (`unix:///run/hookrelayd.sock`) or a TCP
//! address (`tcp://127.0.0.1:8080`).

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tracing::{debug, info};

use crate::error::AddressError;
use crate::registry::Registry;
use crate::service::ServiceSnapshot;

/// Where the API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

impl FromStr for ListenAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| AddressError {
            address: s.to_string(),
            reason,
        };

        match s.split_once("://") {
            Some(("unix" | "tcp", "")) => Err(invalid("missing address after scheme")),
            Some(("unix", path)) => Ok(Self::Unix(PathBuf::from(path))),
            Some(("tcp", addr)) => Ok(Self::Tcp(addr.to_string())),
            Some(_) => Err(invalid("unsupported scheme, expected unix:// or tcp://")),
            None => Err(invalid("missing scheme, expected unix:// or tcp://")),
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Builds the API router over `registry`.
#[must_use]
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/services", get(list_services))
        .route("/services/{service}", get(get_service))
        .with_state(registry)
}

async fn list_services(State(registry): State<Arc<Registry>>) -> Json<Vec<ServiceSnapshot>> {
    Json(registry.services())
}

async fn get_service(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Result<Json<ServiceSnapshot>, StatusCode> {
    match registry.service(&name) {
        Some(service) => Ok(Json(service.snapshot())),
        None => {
            debug!(service = %name, "Unknown service requested");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// Serves the API on `address` until `shutdown` resolves. A stale unix
/// socket file is replaced, and the socket file is removed on return.
///
/// # Errors
///
/// Bind or accept failures.
pub async fn serve<F>(address: &ListenAddress, registry: Arc<Registry>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(registry);
    match address {
        ListenAddress::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
            info!(address = %address, "API listening");
            axum::serve(listener, app).with_graceful_shutdown(shutdown).await
        }
        ListenAddress::Unix(path) => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let listener = tokio::net::UnixListener::bind(path)?;
            info!(address = %address, "API listening");
            let served = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
            let _ = std::fs::remove_file(path);
            served
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    use super::*;
    use crate::config::RelayConfig;
    use crate::transport::MemoryTransport;

    fn registry(dir: &std::path::Path) -> Arc<Registry> {
        fs::write(dir.join("a.yaml"), "Description: first\nTopics: [x]\nHooks:\n  OnReceive: run\n").unwrap();
        fs::write(dir.join("b.yaml"), "Topics: [y]\n").unwrap();
        let registry = Registry::new(RelayConfig::with_services_dir(dir), Arc::new(MemoryTransport::new()));
        registry.load_services().unwrap();
        Arc::new(registry)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(
            "unix:///run/hookrelayd.sock".parse::<ListenAddress>().unwrap(),
            ListenAddress::Unix(PathBuf::from("/run/hookrelayd.sock"))
        );
        assert_eq!(
            "tcp://127.0.0.1:8080".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp("127.0.0.1:8080".to_string())
        );
        assert!("/run/hookrelayd.sock".parse::<ListenAddress>().is_err());
        assert!("http://x".parse::<ListenAddress>().is_err());
        assert!("unix://".parse::<ListenAddress>().is_err());
    }

    #[tokio::test]
    async fn test_list_services() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(registry(dir.path()));

        let (status, json) = get_json(app, "/services").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["Name"], "a.yaml");
        assert_eq!(json[0]["Description"], "first");
        assert_eq!(json[0]["Enabled"], true);
        assert_eq!(json[0]["Topics"][0], "x");
        assert_eq!(json[0]["Hooks"]["OnReceive"], "run");
        assert_eq!(json[1]["Name"], "b.yaml");
    }

    #[tokio::test]
    async fn test_get_service_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let (status, json) = get_json(router(Arc::clone(&registry)), "/services/b.yaml").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["Topics"][0], "y");

        let (status, _) = get_json(router(registry), "/services/missing.yaml").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_on_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let services = dir.path().join("services");
        fs::create_dir(&services).unwrap();
        let registry = registry(&services);

        let socket = dir.path().join("api.sock");
        let address = ListenAddress::Unix(socket.clone());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve(&address, registry, async move {
                let _ = stop_rx.await;
            })
            .await
        });

        let mut stream = None;
        for _ in 0..100 {
            if let Ok(s) = tokio::net::UnixStream::connect(&socket).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut stream = stream.expect("API socket never accepted");

        stream
            .write_all(b"GET /services/a.yaml HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains(r#""Name":"a.yaml""#), "{response}");

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
