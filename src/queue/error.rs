//! Failure taxonomy for queued rendering.
//!
//! Producer failures, cancellation, and internal ordering breaches are kept
//! distinct so the embedding layer can tell "the client left" apart from "the
//! render itself is broken" when it finalises a response.

use std::fmt;

use thiserror::Error;

use super::node::NodeId;
use super::producer::ANONYMOUS;

/// A render task itself failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("component `{component}` failed to render: {message}")]
pub struct ProducerError {
    pub component: String,
    pub message: String,
}

impl ProducerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            component: String::from(ANONYMOUS),
            message: message.into(),
        }
    }

    /// Attribute the failure to a named component.
    pub fn in_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    /// Fill in the node's display name unless the producer already named itself.
    pub(crate) fn attribute_to(mut self, component: &str) -> Self {
        if self.component == ANONYMOUS && !component.is_empty() {
            self.component = component.to_owned();
        }
        self
    }
}

/// Invalid pool capacity, surfaced before any render begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityConfigError {
    #[error("pool capacity must be a positive integer, got {0}")]
    NonPositive(i64),
    #[error("pool capacity {requested} exceeds the supported maximum of {max}")]
    TooLarge { requested: u64, max: usize },
}

/// Why a render stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The embedding layer aborted the request (for example a client disconnect).
    Aborted,
    /// The caller-level deadline elapsed.
    TimedOut,
    /// The shared pool was closed during shutdown.
    PoolClosed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CancelReason::Aborted => "aborted",
            CancelReason::TimedOut => "timed out",
            CancelReason::PoolClosed => "pool closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("render cancelled: {reason}")]
pub struct CancellationError {
    pub reason: CancelReason,
}

impl CancellationError {
    pub fn new(reason: CancelReason) -> Self {
        Self { reason }
    }
}

/// The flush cursor attempted to emit a node before one that precedes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flush order violated: node {next} emitted after node {previous}")]
pub struct OrderingViolation {
    pub previous: NodeId,
    pub next: NodeId,
}

/// A render discovered more nodes than [`NodeId`] can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("render queue is limited to {max} nodes")]
pub struct NodeLimitExceeded {
    pub max: u64,
}

/// An entered boundary is missing from the flush cursor, so the position
/// where its fallback belongs is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flush cursor lost entered boundary {boundary}")]
pub struct CursorDesync {
    pub boundary: NodeId,
}

/// The shared pool no longer hands out slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("node pool has been closed")]
pub struct PoolClosed;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderFailureKind {
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error(transparent)]
    Cancelled(#[from] CancellationError),
    #[error(transparent)]
    Ordering(#[from] OrderingViolation),
    #[error(transparent)]
    Cursor(#[from] CursorDesync),
    #[error(transparent)]
    NodeLimit(#[from] NodeLimitExceeded),
    #[error("scheduler stalled with {unresolved} unresolved nodes")]
    Stalled { unresolved: usize },
}

/// How much output reached the consumer before the stream ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushBoundary {
    pub chunks: usize,
    pub bytes: usize,
    pub last_node: Option<NodeId>,
}

/// Terminal error of a render stream: the cause plus the partial-output boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} (after {} chunks, {} bytes)", .boundary.chunks, .boundary.bytes)]
pub struct RenderFailure {
    #[source]
    pub kind: RenderFailureKind,
    pub boundary: FlushBoundary,
}

impl RenderFailure {
    pub fn new(kind: RenderFailureKind, boundary: FlushBoundary) -> Self {
        Self { kind, boundary }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, RenderFailureKind::Cancelled(_))
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match &self.kind {
            RenderFailureKind::Cancelled(err) => Some(err.reason),
            _ => None,
        }
    }

    pub fn producer_error(&self) -> Option<&ProducerError> {
        match &self.kind {
            RenderFailureKind::Producer(err) => Some(err),
            _ => None,
        }
    }
}
