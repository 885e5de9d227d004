//! The supervisor listener as seen by the cluster: the bootstrap endpoint
//! that joining servers fetch the bundle from, and the routes a managed
//! driver layers on top.

use super::{resolve_token, Cluster, ClusterError, StepContext, StepError};
use crate::bootstrap::{normalize_token, read_from_disk};
use crate::config::{ControlConfig, PROGRAM};
use crate::listener::{
    base_router, cache_file_path, DynamicListener, HandlerChain, ListenerConfig,
};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{info, warn};
use std::fs;
use std::io;
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub const BOOTSTRAP_PATH: &str = "/v1-keystrap/server-bootstrap";

/// Serves the on-disk bundle to callers presenting the cluster token as the
/// basic-auth password.
pub fn bootstrap_router(config: &ControlConfig) -> Router {
    Router::new()
        .route(BOOTSTRAP_PATH, get(serve_bootstrap))
        .with_state(Arc::new(config.clone()))
}

async fn serve_bootstrap(
    State(config): State<Arc<ControlConfig>>,
    headers: HeaderMap,
) -> Response {
    let Some(password) = basic_password(&headers) else {
        return unauthorized();
    };
    let expected = match resolve_token(&config).and_then(|token| normalize_token(&token)) {
        Ok(token) if !token.is_empty() => token,
        Ok(_) => {
            warn!("event=bootstrap_request_rejected reason=no_token");
            return unauthorized();
        }
        Err(err) => {
            warn!("event=bootstrap_request_rejected error={err}");
            return unauthorized();
        }
    };
    let authorized = normalize_token(&password)
        .map(|provided| bool::from(provided.as_bytes().ct_eq(expected.as_bytes())))
        .unwrap_or(false);
    if !authorized {
        return unauthorized();
    }
    match read_from_disk(&config.runtime.bootstrap.role_map()) {
        Ok(bundle) => {
            info!("event=bootstrap_served files={}", bundle.len());
            Json(bundle).into_response()
        }
        Err(err) => {
            warn!("event=bootstrap_read_failed error={err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn basic_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (_, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, format!("Basic realm=\"{PROGRAM}\""))],
    )
        .into_response()
}

impl Cluster {
    async fn new_listener(&self) -> Result<DynamicListener, StepError> {
        let reset_file = self.config.reset_file();
        if self.managed.is_some() && reset_file.exists() {
            let cache = cache_file_path(&self.config.data_dir);
            match fs::remove_file(&cache) {
                Ok(()) => info!(
                    "event=listener_cache_cleared reason=cluster_reset path={}",
                    cache.display()
                ),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StepError::Io { path: cache, source }),
            }
        }
        Ok(DynamicListener::bind(ListenerConfig::from_control(&self.config)).await?)
    }

    /// Binds the listener, installs the bootstrap and driver routes, and
    /// starts serving.
    pub(super) async fn init_cluster_and_https(&mut self) -> Result<(), ClusterError> {
        let listener = self.new_listener().await.step("init listener")?;
        let chain = HandlerChain::new(base_router().merge(bootstrap_router(&self.config)));
        chain
            .try_wrap(|router| self.init_cluster_db(router))
            .step("init cluster datastore")?;
        let handle = listener
            .spawn(chain, self.cancel.child_token())
            .step("start listener")?;
        info!(
            "event=cluster_https_started addr={}",
            handle.local_addr()
        );
        self.listener = Some(handle);
        Ok(())
    }
}
