use std::{collections::HashMap, net::IpAddr, time::Instant};

use tokio::sync::Mutex;

use crate::config::RateLimit;

/// Callers without a known peer address share this bucket.
pub type ClientKey = Option<IpAddr>;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter per client address.
///
/// Single-process and in-memory only; counts are lost on restart.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimit,
    windows: Mutex<HashMap<ClientKey, Window>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimit) -> RateLimiter {
        RateLimiter {
            policy,
            windows: Mutex::default(),
        }
    }

    /// Counts one request from `client`; `false` means it is over the ceiling.
    pub async fn check(&self, client: ClientKey) -> bool {
        self.check_at(client, Instant::now()).await
    }

    pub async fn check_at(&self, client: ClientKey, now: Instant) -> bool {
        let window = self.policy.window;
        let mut windows = self.windows.lock().await;
        // lazily drop windows that have run out
        windows.retain(|_, w| now.saturating_duration_since(w.started) < window);

        let entry = windows.entry(client).or_insert(Window {
            started: now,
            count: 0,
        });
        if entry.count >= self.policy.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Number of addresses with a live window.
    pub async fn tracked(&self) -> usize {
        self.windows.lock().await.len()
    }
}
