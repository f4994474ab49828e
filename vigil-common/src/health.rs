//! Readiness flags and the `/health` route.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Router, http::StatusCode, routing::get};
use parking_lot::Mutex;

/// Tracks the readiness of the background services of one process.
///
/// Each service registers a flag with [`StartedServices::new_service`] and
/// stores `true` once it finished its startup work; `/health` reports 200
/// only when every registered flag is set.
#[derive(Default, Clone)]
pub struct StartedServices(Arc<Mutex<Vec<Arc<AtomicBool>>>>);

impl StartedServices {
    /// Registers a new service and returns its readiness flag.
    pub fn new_service(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.0.lock().push(Arc::clone(&flag));
        flag
    }

    /// Returns `true` iff every registered service reported readiness.
    pub fn all_started(&self) -> bool {
        self.0.lock().iter().all(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Creates a `Router` with a single `/health` route over the given flags.
pub fn routes(started: StartedServices) -> Router {
    Router::new().route(
        "/health",
        get(move || {
            let started = started.clone();
            async move {
                if started.all_started() {
                    (StatusCode::OK, "ok")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "starting")
                }
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_flips_once_all_services_started() {
        let started = StartedServices::default();
        let first = started.new_service();
        let second = started.new_service();
        let server = axum_test::TestServer::new(routes(started.clone())).unwrap();

        server.get("/health").await.assert_status_service_unavailable();
        first.store(true, Ordering::Relaxed);
        server.get("/health").await.assert_status_service_unavailable();
        second.store(true, Ordering::Relaxed);
        server.get("/health").await.assert_status_ok();
    }
}
