//! Built-in applications available to every image run by this binary.

use std::sync::OnceLock;

use async_trait::async_trait;
use berth::{AppContext, Application, BerthResult, EntryTarget, Response, Scope};
use bytes::Bytes;
use hyper::StatusCode;
use serde_json::json;

/// `server:app`: answers every request with a JSON status document.
#[derive(Default)]
pub struct StatusApp {
    container_id: OnceLock<String>,
}

#[async_trait]
impl Application for StatusApp {
    async fn startup(&self, ctx: &AppContext) -> BerthResult<()> {
        let _ = self.container_id.set(ctx.container_id.clone());
        tracing::info!(container_id = %ctx.container_id, "Status application started");
        Ok(())
    }

    async fn call(&self, scope: Scope, _body: Bytes) -> Response {
        let body = json!({
            "status": "ok",
            "container": self.container_id.get(),
            "method": scope.method.as_str(),
            "path": scope.path,
        });
        Response::json(StatusCode::OK, &body)
    }
}

berth::register_entry_point!("server", "app", || EntryTarget::application(
    StatusApp::default()
));
