//! Budget stores behind the rate limiter

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::rate_limit::LimiterError;

/// Expired windows are swept once the map grows past this many keys
const SWEEP_THRESHOLD: usize = 10_000;

/// Outcome of one atomic check-and-take against a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    /// Whether the requested cost was taken
    pub allowed: bool,
    /// Points used in the current window after this call
    pub consumed: u32,
    /// Time until the window replenishes
    pub ms_before_next: u64,
}

/// Where window state lives.
///
/// Implementations must make `consume` atomic: concurrent callers sharing a
/// key never take more than `points` in one window between them.
#[async_trait]
pub trait LimiterStore: Send + Sync + Debug {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Take `cost` points from the fixed window at `key` if the budget allows.
    ///
    /// Rejected calls do not use budget.
    async fn consume(
        &self,
        key: &str,
        cost: u32,
        points: u32,
        window: Duration,
    ) -> Result<Consumption, LimiterError>;

    /// Drop the window at `key`, restoring its full budget
    async fn reset(&self, key: &str) -> Result<(), LimiterError>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    consumed: u32,
    resets_at: Instant,
}

/// Process-local store.
///
/// Only correct when a single process calls the limited resource.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn millis_ceil(duration: Duration) -> u64 {
    let micros = duration.as_micros();
    micros.div_ceil(1000) as u64
}

#[async_trait]
impl LimiterStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn consume(
        &self,
        key: &str,
        cost: u32,
        points: u32,
        window: Duration,
    ) -> Result<Consumption, LimiterError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if windows.len() > SWEEP_THRESHOLD {
            windows.retain(|_, w| w.resets_at > now);
        }

        let state = windows.entry(key.to_string()).or_insert(Window {
            consumed: 0,
            resets_at: now + window,
        });

        // Window expired: replenish
        if now >= state.resets_at {
            *state = Window {
                consumed: 0,
                resets_at: now + window,
            };
        }

        let ms_before_next = millis_ceil(state.resets_at - now);
        let allowed = state.consumed.saturating_add(cost) <= points;
        if allowed {
            state.consumed += cost;
        }

        Ok(Consumption {
            allowed,
            consumed: state.consumed,
            ms_before_next,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.windows.lock().await.remove(key);
        Ok(())
    }
}
