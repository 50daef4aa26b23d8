//! Application contract served by the launcher.
//!
//! An application is an asynchronous request/response object. The launcher
//! resolves it by reference (`module:attribute`) through the
//! [`EntryPointRegistry`], runs its lifespan hooks and hands it one call per
//! HTTP request.

mod reference;
mod registry;

pub use reference::EntryPointRef;
pub use registry::{EntryFactory, EntryPointRegistration, EntryPointRegistry, EntryTarget};

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use berth_shared::errors::BerthResult;
use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};

/// Request metadata passed to [`Application::call`].
#[derive(Debug, Clone)]
pub struct Scope {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub client: Option<SocketAddr>,
    pub server: SocketAddr,
}

/// Response produced by an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status, body.into()).with_header("content-type", "text/plain; charset=utf-8")
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// What an application sees of its container during startup.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub container_id: String,
    /// Host path of the container root filesystem.
    pub rootfs: PathBuf,
    /// Host path of the image working directory.
    pub working_dir: PathBuf,
    /// Merged environment (`KEY=VALUE`, sorted).
    pub env: Vec<String>,
    /// Address the listener will bind.
    pub bind_addr: SocketAddr,
}

impl AppContext {
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Asynchronous request/response application.
#[async_trait]
pub trait Application: Send + Sync {
    /// Lifespan startup. An error is fatal to the container.
    async fn startup(&self, _ctx: &AppContext) -> BerthResult<()> {
        Ok(())
    }

    async fn call(&self, scope: Scope, body: Bytes) -> Response;

    /// Lifespan shutdown, after the last connection is closed.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_builders() {
        let response = Response::json(StatusCode::OK, &serde_json::json!({"status": "ok"}));
        assert_eq!(response.body, Bytes::from(r#"{"status":"ok"}"#));
        assert_eq!(
            response.headers,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn test_env_var_lookup() {
        let ctx = AppContext {
            container_id: "c".into(),
            rootfs: PathBuf::from("/tmp/rootfs"),
            working_dir: PathBuf::from("/tmp/rootfs/app"),
            env: vec!["A=1".into(), "B=x=y".into()],
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
        };
        assert_eq!(ctx.env_var("B"), Some("x=y"));
        assert_eq!(ctx.env_var("C"), None);
    }
}
