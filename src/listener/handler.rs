use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use std::sync::Arc;

pub const NOT_READY_BODY: &str = "datastore not ready";

/// The router served by the listener. Layers are added while the server is
/// already accepting; each request is routed with the router current at the
/// time it arrives.
#[derive(Clone)]
pub struct HandlerChain {
    router: Arc<RwLock<Router>>,
}

impl HandlerChain {
    pub fn new(base: Router) -> Self {
        Self {
            router: Arc::new(RwLock::new(base)),
        }
    }

    pub fn current(&self) -> Router {
        self.router.read().clone()
    }

    pub fn wrap<F>(&self, wrap: F)
    where
        F: FnOnce(Router) -> Router,
    {
        let mut guard = self.router.write();
        let current = guard.clone();
        *guard = wrap(current);
    }

    /// Like [`wrap`](Self::wrap); on error the chain is left unchanged.
    pub fn try_wrap<F, E>(&self, wrap: F) -> Result<(), E>
    where
        F: FnOnce(Router) -> Result<Router, E>,
    {
        let mut guard = self.router.write();
        let current = guard.clone();
        *guard = wrap(current)?;
        Ok(())
    }
}

/// `/ping` plus a 503 fallback for everything not yet routed.
pub fn base_router() -> Router {
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .fallback(|| async { (StatusCode::SERVICE_UNAVAILABLE, NOT_READY_BODY) })
}
