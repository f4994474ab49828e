#![deny(missing_docs)]
//! Sliding-window client admission.
//!
//! The gateway asks [`RateLimiter::allow`] before accepting a frame. A
//! request is admitted if its client is already inside its active window, or
//! if the number of distinct active clients is still below the configured
//! bound. A client is *active* while less than one window has passed since
//! `max(window_start, last_seen)`; everything uses wall-clock milliseconds.
//!
//! A background sweeper thread drops entries that fell out of the window.
//! Once shutdown begins every request is denied, so no request can slip in
//! while the process drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use vigil_common::profile::RateLimiterConfig;

/// Metrics key counting denied requests.
pub const METRICS_ID_RATELIMIT_DENIED: &str = "vigil.ratelimit.denied";
/// Metrics key for the number of tracked client windows.
pub const METRICS_ID_RATELIMIT_TRACKED: &str = "vigil.ratelimit.tracked";

/// Describe all metrics used by the rate limiter.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_RATELIMIT_DENIED,
        metrics::Unit::Count,
        "Number of requests denied by the rate limiter"
    );
    metrics::describe_gauge!(
        METRICS_ID_RATELIMIT_TRACKED,
        metrics::Unit::Count,
        "Number of client windows currently tracked"
    );
}

#[derive(Debug, Clone, Copy)]
struct ClientWindow {
    count_in_window: u64,
    window_start: u64,
    last_seen: u64,
}

impl ClientWindow {
    fn active_edge(&self) -> u64 {
        self.window_start.max(self.last_seen)
    }

    fn is_active(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.active_edge()) < window_ms
    }
}

struct Shared {
    window_ms: u64,
    max_clients: u32,
    clients: Mutex<HashMap<String, ClientWindow>>,
    shutdown: AtomicBool,
    sweeper_stop: Mutex<bool>,
    sweeper_wake: Condvar,
}

/// Process-wide sliding-window admission.
pub struct RateLimiter {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RateLimiter {
    /// Creates the limiter and starts its sweeper thread.
    pub fn new(config: RateLimiterConfig) -> Self {
        let shared = Arc::new(Shared {
            window_ms: config.window.as_millis().max(1) as u64,
            max_clients: config.max_clients,
            clients: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            sweeper_stop: Mutex::new(false),
            sweeper_wake: Condvar::new(),
        });
        let sweeper = std::thread::Builder::new()
            .name("ratelimit-sweeper".to_owned())
            .spawn({
                let shared = Arc::clone(&shared);
                let interval = config.cleanup_interval.max(std::time::Duration::from_millis(1));
                move || {
                    let mut stopped = shared.sweeper_stop.lock();
                    while !*stopped {
                        shared.sweeper_wake.wait_for(&mut stopped, interval);
                        if *stopped {
                            break;
                        }
                        shared.sweep_at(now_ms());
                    }
                }
            })
            .expect("can spawn sweeper thread");
        Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Decides whether a request of `client_id` is admitted right now.
    ///
    /// Total: policy denials are the only "failure" and are expressed in the
    /// return value.
    pub fn allow(&self, client_id: &str) -> bool {
        self.shared.allow_at(client_id, now_ms())
    }

    /// Denies all further requests and stops the sweeper. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        {
            let mut stopped = self.shared.sweeper_stop.lock();
            *stopped = true;
        }
        self.shared.sweeper_wake.notify_all();
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn allow_at(&self, client_id: &str, now_ms: u64) -> bool {
        if self.shutdown.load(Ordering::Relaxed) {
            ::metrics::counter!(METRICS_ID_RATELIMIT_DENIED).increment(1);
            return false;
        }
        let mut clients = self.clients.lock();
        let client_active = clients
            .get(client_id)
            .map(|window| window.is_active(now_ms, self.window_ms))
            .unwrap_or(false);
        if !client_active {
            let active = clients
                .values()
                .filter(|window| window.is_active(now_ms, self.window_ms))
                .count();
            if active >= self.max_clients as usize {
                tracing::warn!("request denied for client {client_id}: {active} active clients");
                ::metrics::counter!(METRICS_ID_RATELIMIT_DENIED).increment(1);
                return false;
            }
        }
        let window = clients.entry(client_id.to_owned()).or_insert(ClientWindow {
            count_in_window: 0,
            window_start: now_ms,
            last_seen: now_ms,
        });
        if !client_active {
            window.count_in_window = 0;
            window.window_start = now_ms;
        }
        window.last_seen = now_ms;
        window.count_in_window += 1;
        tracing::debug!(
            "request allowed for client {client_id} (count {} since {})",
            window.count_in_window,
            window.window_start / 1000
        );
        ::metrics::gauge!(METRICS_ID_RATELIMIT_TRACKED).set(clients.len() as f64);
        true
    }

    fn sweep_at(&self, now_ms: u64) {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, window| now_ms.saturating_sub(window.active_edge()) < self.window_ms);
        let removed = before - clients.len();
        if removed > 0 {
            tracing::debug!("sweeper removed {removed} stale client window(s)");
        }
        ::metrics::gauge!(METRICS_ID_RATELIMIT_TRACKED).set(clients.len() as f64);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock is past the epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn limiter(max_clients: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_clients,
            window: Duration::from_millis(window_ms),
            cleanup_interval: Duration::from_millis(window_ms),
        })
    }

    #[test]
    fn admits_up_to_max_distinct_clients() {
        let limiter = limiter(2, 1_000);
        assert!(limiter.shared.allow_at("a", 0));
        assert!(limiter.shared.allow_at("b", 10));
        // a third distinct client inside the same window is denied
        assert!(!limiter.shared.allow_at("c", 20));
        // already-active clients keep being admitted at the boundary
        assert!(limiter.shared.allow_at("a", 30));
        assert!(limiter.shared.allow_at("b", 30));
    }

    #[test]
    fn window_expiry_frees_a_slot() {
        let limiter = limiter(1, 100);
        assert!(limiter.shared.allow_at("a", 0));
        assert!(!limiter.shared.allow_at("b", 50));
        // a's window has fully passed; b now takes the slot
        assert!(limiter.shared.allow_at("b", 101));
        assert!(!limiter.shared.allow_at("a", 150));
    }

    #[test]
    fn activity_extends_the_window() {
        let limiter = limiter(1, 100);
        assert!(limiter.shared.allow_at("a", 0));
        assert!(limiter.shared.allow_at("a", 90));
        // last_seen moved to 90, so "a" is still active at 150
        assert!(!limiter.shared.allow_at("b", 150));
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let limiter = limiter(10, 100);
        assert!(limiter.shared.allow_at("stale", 0));
        assert!(limiter.shared.allow_at("fresh", 80));
        limiter.shared.sweep_at(120);
        let clients = limiter.shared.clients.lock();
        assert!(!clients.contains_key("stale"));
        assert!(clients.contains_key("fresh"));
    }

    #[test]
    fn shutdown_denies_everything() {
        let limiter = limiter(10, 1_000);
        assert!(limiter.allow("a"));
        limiter.shutdown();
        assert!(!limiter.allow("a"));
        // idempotent
        limiter.shutdown();
    }

    #[test]
    fn concurrent_allows_never_exceed_the_bound() {
        let limiter = std::sync::Arc::new(limiter(4, 10_000));
        let admitted = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..16 {
            let limiter = std::sync::Arc::clone(&limiter);
            let admitted = std::sync::Arc::clone(&admitted);
            handles.push(std::thread::spawn(move || {
                if limiter.allow(&format!("client-{i}")) {
                    admitted.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(admitted.load(Ordering::Relaxed) <= 4);
    }
}
