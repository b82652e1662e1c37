//! Per-source request rate limiting
//!
//! Sliding-window tracker: at most `max_requests` fetches per `window`,
//! independently per source. Leaf component; the orchestrator awaits
//! [`SourceRateLimiter::acquire`] before every upstream call.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window rate limiter for one source
#[derive(Debug)]
pub struct SourceRateLimiter {
    max_requests: u32,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl SourceRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// How long until the next request slot frees up, if the window is full
    ///
    /// Does not record a request.
    pub fn wait_needed(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());

        while let Some(&front) = recent.front() {
            if now.duration_since(front) >= self.window {
                recent.pop_front();
            } else {
                break;
            }
        }

        if (recent.len() as u32) < self.max_requests {
            None
        } else {
            // Oldest in-window request ages out first
            recent
                .front()
                .map(|&front| self.window.saturating_sub(now.duration_since(front)))
        }
    }

    /// Wait for a request slot and claim it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());

                while let Some(&front) = recent.front() {
                    if now.duration_since(front) >= self.window {
                        recent.pop_front();
                    } else {
                        break;
                    }
                }

                if (recent.len() as u32) < self.max_requests {
                    recent.push_back(now);
                    return;
                }

                recent
                    .front()
                    .map(|&front| self.window.saturating_sub(now.duration_since(front)))
                    .unwrap_or(self.window)
            };

            tokio::time::sleep(wait).await;
        }
    }
}
