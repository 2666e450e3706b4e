//! Queued rendering: bounded-concurrency execution of a lazily discovered
//! producer tree with document-ordered streaming output.
//!
//! - [`pool`] owns the process-wide admission gate and recycles node shells.
//! - [`builder`] links children into the [`RenderQueue`] as producers expand.
//! - [`render_queue`] holds one request's nodes and the flush cursor.
//! - [`scheduler`] drives execution and exposes the output stream.

pub mod builder;
pub mod error;
pub(crate) mod lock;
pub mod node;
pub mod pool;
pub mod producer;
pub mod render_queue;
pub mod scheduler;

/// Names of the metrics reported by the queue.
pub mod metric_names {
    pub const NODE_ACQUIRE_TOTAL: &str = "render_queue_node_acquire_total";
    pub const NODE_RELEASE_TOTAL: &str = "render_queue_node_release_total";
    pub const CONTENT_CACHE_TOTAL: &str = "render_queue_content_cache_total";
    pub const SLOTS_IN_USE: &str = "render_queue_slots_in_use";
    pub const CHUNKS_FLUSHED_TOTAL: &str = "render_queue_chunks_flushed_total";
    pub const RENDER_TOTAL: &str = "render_queue_render_total";
    pub const RENDER_MS: &str = "render_queue_render_ms";
}

pub use builder::QueueBuilder;
pub use error::{
    CancelReason, CancellationError, CapacityConfigError, CursorDesync, FlushBoundary,
    NodeLimitExceeded, OrderingViolation, PoolClosed, ProducerError, RenderFailure,
    RenderFailureKind,
};
pub use node::{NodeId, NodeState, QueueNode, Segment, StackItem};
pub use pool::{COMMON_HTML_PATTERNS, DEFAULT_POOL_SIZE, NodePool, PoolConfig, PoolSlot, PoolStats};
pub use producer::{
    ANONYMOUS, Component, Fragment, Producer, Render, RenderContext, Template, component,
};
pub use render_queue::{Chunk, RenderQueue};
pub use scheduler::{
    CancelHandle, QueueRenderer, RenderOptions, RenderOutcome, RenderReport, RenderStream,
};
