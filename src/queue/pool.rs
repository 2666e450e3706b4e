//! Process-wide node pool.
//!
//! The pool plays two roles:
//!
//! - **Admission control**: a render must hold a [`PoolSlot`] while its
//!   producer runs or awaits an external value. At most `capacity` slots are
//!   checked out across every render sharing the pool.
//! - **Recycling**: released [`QueueNode`] shells and repeated markup
//!   fragments are kept for reuse so long streaming renders do not allocate
//!   per node.
//!
//! The pool is constructed once at startup and passed explicitly to every
//! renderer; clones share the same state.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lru::LruCache;
use metrics::{counter, gauge};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use super::error::{CapacityConfigError, PoolClosed};
use super::lock::mutex_lock;
use super::metric_names;
use super::node::QueueNode;
use super::producer::Fragment;

const SOURCE: &str = "queue::pool";

/// Capacity used when queued rendering is enabled without an explicit size.
pub const DEFAULT_POOL_SIZE: usize = 1000;

const DEFAULT_CONTENT_CACHE_LIMIT: usize = 4096;

/// Markup that shows up on nearly every page; used to pre-warm the fragment cache.
pub const COMMON_HTML_PATTERNS: &[&str] = &[
    "<div>", "</div>", "<span>", "</span>", "<p>", "</p>", "<section>", "</section>",
    "<article>", "</article>", "<header>", "</header>", "<footer>", "</footer>", "<nav>",
    "</nav>", "<main>", "</main>", "<aside>", "</aside>", "<ul>", "</ul>", "<ol>", "</ol>",
    "<li>", "</li>", "<br>", "<hr>", "<br/>", "<hr/>", "<h1>", "</h1>", "<h2>", "</h2>",
    "<h3>", "</h3>", "<h4>", "</h4>", "<a>", "</a>", "<strong>", "</strong>", "<em>",
    "</em>", "<code>", "</code>", " ", "\n",
];

/// Validated pool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    capacity: NonZeroUsize,
    cache: bool,
}

impl PoolConfig {
    /// Validate a configured capacity. Zero and negative values are rejected.
    pub fn new(capacity: i64) -> Result<Self, CapacityConfigError> {
        if capacity <= 0 {
            return Err(CapacityConfigError::NonPositive(capacity));
        }
        let requested = capacity.unsigned_abs();
        let capacity = usize::try_from(requested)
            .ok()
            .filter(|value| *value <= Semaphore::MAX_PERMITS)
            .and_then(NonZeroUsize::new)
            .ok_or(CapacityConfigError::TooLarge {
                requested,
                max: Semaphore::MAX_PERMITS,
            })?;
        Ok(Self::with_capacity(capacity))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            cache: true,
        }
    }

    /// Retain released shells and intern repeated markup.
    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::with_capacity(NonZeroUsize::new(DEFAULT_POOL_SIZE).unwrap_or(NonZeroUsize::MIN))
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    pub acquired_from_pool: u64,
    pub acquired_new: u64,
    pub released: u64,
    pub released_dropped: u64,
    pub content_cache_hit: u64,
    pub content_cache_miss: u64,
    pub available: usize,
    pub slots_in_use: usize,
    pub slots_high_watermark: usize,
    pub capacity: usize,
}

impl PoolStats {
    /// Percentage of shell acquisitions served from the reservoir.
    pub fn hit_rate(&self) -> f64 {
        let total = self.acquired_from_pool + self.acquired_new;
        if total == 0 {
            return 0.0;
        }
        self.acquired_from_pool as f64 / total as f64 * 100.0
    }
}

#[derive(Default)]
struct Counters {
    acquired_from_pool: AtomicU64,
    acquired_new: AtomicU64,
    released: AtomicU64,
    released_dropped: AtomicU64,
    content_cache_hit: AtomicU64,
    content_cache_miss: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.acquired_from_pool,
            &self.acquired_new,
            &self.released,
            &self.released_dropped,
            &self.content_cache_hit,
            &self.content_cache_miss,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

struct PoolInner {
    capacity: usize,
    bounded: bool,
    cache: bool,
    slots: Arc<Semaphore>,
    in_use: AtomicUsize,
    high_watermark: AtomicUsize,
    available: Mutex<Vec<QueueNode>>,
    content: Mutex<LruCache<String, Fragment>>,
    counters: Counters,
}

/// Shared handle to the node pool.
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

impl NodePool {
    pub fn new(config: PoolConfig) -> Self {
        Self::build(config.capacity(), true, config.cache)
    }

    /// A pool without admission control, used when queued rendering is disabled.
    pub fn unbounded(cache: bool) -> Self {
        Self::build(Semaphore::MAX_PERMITS, false, cache)
    }

    fn build(capacity: usize, bounded: bool, cache: bool) -> Self {
        let content_limit =
            NonZeroUsize::new(DEFAULT_CONTENT_CACHE_LIMIT).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                bounded,
                cache,
                slots: Arc::new(Semaphore::new(capacity)),
                in_use: AtomicUsize::new(0),
                high_watermark: AtomicUsize::new(0),
                available: Mutex::new(Vec::new()),
                content: Mutex::new(LruCache::new(content_limit)),
                counters: Counters::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_bounded(&self) -> bool {
        self.inner.bounded
    }

    pub fn cache_enabled(&self) -> bool {
        self.inner.cache
    }

    // ------------------------------------------------------------------
    // Admission control
    // ------------------------------------------------------------------

    /// Wait for a free slot.
    pub async fn acquire_slot(&self) -> Result<PoolSlot, PoolClosed> {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;
        Ok(self.check_out(permit))
    }

    /// Take a free slot without waiting.
    pub fn try_acquire_slot(&self) -> Result<Option<PoolSlot>, PoolClosed> {
        match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(permit) => Ok(Some(self.check_out(permit))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(PoolClosed),
        }
    }

    fn check_out(&self, permit: OwnedSemaphorePermit) -> PoolSlot {
        let in_use = self.inner.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.high_watermark.fetch_max(in_use, Ordering::AcqRel);
        gauge!(metric_names::SLOTS_IN_USE).set(in_use as f64);
        PoolSlot {
            _permit: permit,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Slots currently checked out across all renders.
    pub fn slots_in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    pub fn high_watermark(&self) -> usize {
        self.inner.high_watermark.load(Ordering::Acquire)
    }

    /// Stop handing out slots. Renders waiting for one end as cancelled.
    pub fn close(&self) {
        self.inner.slots.close();
        self.clear();
        debug!(target_module = SOURCE, capacity = self.inner.capacity, "Node pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slots.is_closed()
    }

    // ------------------------------------------------------------------
    // Shell recycling
    // ------------------------------------------------------------------

    /// A cleared node shell, reused when one is available.
    pub fn acquire_shell(&self) -> QueueNode {
        let reused = if self.inner.cache {
            mutex_lock(&self.inner.available, SOURCE, "acquire_shell").pop()
        } else {
            None
        };

        match reused {
            Some(node) => {
                self.inner
                    .counters
                    .acquired_from_pool
                    .fetch_add(1, Ordering::Relaxed);
                counter!(metric_names::NODE_ACQUIRE_TOTAL, "source" => "pool").increment(1);
                node
            }
            None => {
                self.inner
                    .counters
                    .acquired_new
                    .fetch_add(1, Ordering::Relaxed);
                counter!(metric_names::NODE_ACQUIRE_TOTAL, "source" => "new").increment(1);
                QueueNode::shell()
            }
        }
    }

    /// Return a shell once its output has been consumed. The shell is cleared
    /// first; it is dropped when caching is off or the reservoir is full.
    pub fn release(&self, mut node: QueueNode) {
        node.reset();
        if self.inner.cache {
            let mut available = mutex_lock(&self.inner.available, SOURCE, "release");
            if available.len() < self.retain_limit() {
                available.push(node);
                drop(available);
                self.inner.counters.released.fetch_add(1, Ordering::Relaxed);
                counter!(metric_names::NODE_RELEASE_TOTAL, "outcome" => "retained").increment(1);
                return;
            }
        }
        self.inner
            .counters
            .released_dropped
            .fetch_add(1, Ordering::Relaxed);
        counter!(metric_names::NODE_RELEASE_TOTAL, "outcome" => "dropped").increment(1);
    }

    pub fn release_all<I>(&self, nodes: I)
    where
        I: IntoIterator<Item = QueueNode>,
    {
        for node in nodes {
            self.release(node);
        }
    }

    /// Number of shells ready for reuse.
    pub fn available(&self) -> usize {
        mutex_lock(&self.inner.available, SOURCE, "available").len()
    }

    /// Drop every retained shell.
    pub fn clear(&self) {
        mutex_lock(&self.inner.available, SOURCE, "clear").clear();
    }

    fn retain_limit(&self) -> usize {
        if self.inner.bounded {
            self.inner.capacity
        } else {
            DEFAULT_POOL_SIZE
        }
    }

    // ------------------------------------------------------------------
    // Content-aware fragment cache
    // ------------------------------------------------------------------

    /// Shared fragment for `markup`. Repeated markup resolves to the same
    /// buffer while caching is enabled.
    pub fn intern(&self, markup: &str) -> Fragment {
        if !self.inner.cache {
            return Fragment::from(markup.to_owned());
        }

        let mut content = mutex_lock(&self.inner.content, SOURCE, "intern");
        if let Some(fragment) = content.get(markup) {
            self.inner
                .counters
                .content_cache_hit
                .fetch_add(1, Ordering::Relaxed);
            counter!(metric_names::CONTENT_CACHE_TOTAL, "result" => "hit").increment(1);
            return fragment.clone();
        }

        let fragment = Fragment::from(markup.to_owned());
        content.put(markup.to_owned(), fragment.clone());
        self.inner
            .counters
            .content_cache_miss
            .fetch_add(1, Ordering::Relaxed);
        counter!(metric_names::CONTENT_CACHE_TOTAL, "result" => "miss").increment(1);
        fragment
    }

    /// Pre-populate the fragment cache without touching hit/miss statistics.
    pub fn warm_cache<'a, I>(&self, patterns: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        if !self.inner.cache {
            return;
        }
        let mut content = mutex_lock(&self.inner.content, SOURCE, "warm_cache");
        for pattern in patterns {
            if !content.contains(pattern) {
                content.put(pattern.to_owned(), Fragment::from(pattern.to_owned()));
            }
        }
    }

    pub fn content_cache_len(&self) -> usize {
        mutex_lock(&self.inner.content, SOURCE, "content_cache_len").len()
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        PoolStats {
            acquired_from_pool: counters.acquired_from_pool.load(Ordering::Relaxed),
            acquired_new: counters.acquired_new.load(Ordering::Relaxed),
            released: counters.released.load(Ordering::Relaxed),
            released_dropped: counters.released_dropped.load(Ordering::Relaxed),
            content_cache_hit: counters.content_cache_hit.load(Ordering::Relaxed),
            content_cache_miss: counters.content_cache_miss.load(Ordering::Relaxed),
            available: self.available(),
            slots_in_use: self.slots_in_use(),
            slots_high_watermark: self.high_watermark(),
            capacity: self.capacity(),
        }
    }

    /// Zero the counters and the high watermark.
    pub fn reset_stats(&self) {
        self.inner.counters.reset();
        self.inner
            .high_watermark
            .store(self.slots_in_use(), Ordering::Release);
    }
}

impl Default for NodePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// A checked-out slot. Dropping it frees the slot.
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        let remaining = self.pool.in_use.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        gauge!(metric_names::SLOTS_IN_USE).set(remaining as f64);
    }
}
