use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use tenantflow_core::TenantId;

use super::window::{SlidingWindow, WindowState};
use super::{RateLimitError, ResourceClass};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub tenant_id: TenantId,
    pub class: ResourceClass,
}

impl CounterKey {
    pub fn new(tenant_id: TenantId, class: ResourceClass) -> Self {
        Self { tenant_id, class }
    }
}

impl core::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.class)
    }
}

/// Sliding-window counter backend. Each call is atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn try_consume(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError>;

    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError>;

    async fn reset(&self, key: &CounterKey) -> Result<(), RateLimitError>;

    /// Append an event admitted elsewhere, ignoring the cap.
    async fn record(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitError> {
        self.try_consume(key, window, u32::MAX, now).await.map(|_| ())
    }
}

#[async_trait]
impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    async fn try_consume(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError> {
        (**self).try_consume(key, window, cap, now).await
    }

    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError> {
        (**self).peek(key, window, cap, now).await
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), RateLimitError> {
        (**self).reset(key).await
    }

    async fn record(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitError> {
        (**self).record(key, window, now).await
    }
}

#[derive(Debug)]
struct Entry {
    window: SlidingWindow,
    last_used: u64,
}

/// Windows keyed by counter, evicting the least recently used key once
/// `capacity` is reached.
#[derive(Debug)]
struct LruWindows {
    capacity: usize,
    tick: u64,
    entries: HashMap<CounterKey, Entry>,
    recency: BTreeMap<u64, CounterKey>,
}

impl LruWindows {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn touch(&mut self, key: &CounterKey) -> &mut SlidingWindow {
        self.tick += 1;
        let tick = self.tick;

        if let Some(entry) = self.entries.get(key) {
            self.recency.remove(&entry.last_used);
        } else {
            while self.entries.len() >= self.capacity {
                let Some((_, evicted)) = self.recency.pop_first() else {
                    break;
                };
                self.entries.remove(&evicted);
            }
        }
        self.recency.insert(tick, key.clone());

        let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
            window: SlidingWindow::new(),
            last_used: tick,
        });
        entry.last_used = tick;
        &mut entry.window
    }

    fn remove(&mut self, key: &CounterKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.last_used);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Process-local counters bounded to `capacity` keys.
///
/// Eviction forgets a key's history, which can only make the limiter more
/// permissive for a cold tenant, never stricter.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    windows: Mutex<LruWindows>,
}

impl InMemoryCounterStore {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        Self {
            windows: Mutex::new(LruWindows::new(capacity)),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruWindows>, RateLimitError> {
        self.windows
            .lock()
            .map_err(|_| RateLimitError::Unavailable("counter table poisoned".into()))
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn try_consume(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError> {
        Ok(self.lock()?.touch(key).try_consume(now, window, cap))
    }

    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError> {
        let mut windows = self.lock()?;
        match windows.entries.get_mut(key) {
            Some(entry) => Ok(entry.window.peek(now, window, cap)),
            None => Ok(WindowState {
                allowed: cap > 0,
                count: 0,
                reset_at: now + window,
            }),
        }
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), RateLimitError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
