//! Queue node data model.

use std::fmt;

use super::producer::{Fragment, Producer};

/// Stable identifier of a node within one render queue, assigned at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Number of distinct ids one render queue can hand out.
    pub const LIMIT: u64 = u32::MAX as u64 + 1;

    /// Id for arena slot `index`, or `None` once ids are exhausted.
    pub(crate) fn try_from_index(index: usize) -> Option<Self> {
        u32::try_from(index).ok().map(Self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle: `Pending → Running → {Completed | Suspended → Running | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Discovered, waiting for a pool slot.
    Pending,
    /// Holding a pool slot while its producer runs.
    Running,
    /// Waiting on an external value (slot kept) or on its children (slot released).
    Suspended,
    Completed,
    Failed,
}

impl NodeState {
    pub fn is_settled(self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Failed)
    }
}

/// One piece of a node's output, in document order.
#[derive(Debug, Clone)]
pub enum Segment {
    Html(Fragment),
    Child(NodeId),
}

/// One schedulable unit of rendering work.
///
/// Shells are recycled through the pool; [`QueueNode::reset`] drops every
/// reference the previous render left behind while keeping allocations.
pub struct QueueNode {
    pub(crate) id: NodeId,
    pub(crate) state: NodeState,
    pub(crate) producer: Option<Box<dyn Producer>>,
    pub(crate) display_name: String,
    pub(crate) parent: Option<NodeId>,
    /// Child indices from the root; lexicographic order is document order.
    pub(crate) path: Vec<u32>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) output: Option<Fragment>,
    /// Descendants folded into `output`, pre-order.
    pub(crate) absorbed: Vec<NodeId>,
    pub(crate) pending_children: usize,
    /// The producer has returned its own result (leaf markup or template).
    pub(crate) own_settled: bool,
    /// The flush cursor has descended into this node.
    pub(crate) entered: bool,
    pub(crate) boundary: Option<Fragment>,
    /// Output no longer wanted; an in-flight result is dropped on arrival.
    pub(crate) discarded: bool,
}

impl QueueNode {
    pub(crate) fn shell() -> Self {
        Self {
            id: NodeId::ROOT,
            state: NodeState::Pending,
            producer: None,
            display_name: String::new(),
            parent: None,
            path: Vec::new(),
            children: Vec::new(),
            segments: Vec::new(),
            output: None,
            absorbed: Vec::new(),
            pending_children: 0,
            own_settled: false,
            entered: false,
            boundary: None,
            discarded: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.id = NodeId::ROOT;
        self.state = NodeState::Pending;
        self.producer = None;
        self.display_name.clear();
        self.parent = None;
        self.path.clear();
        self.children.clear();
        self.segments.clear();
        self.output = None;
        self.absorbed.clear();
        self.pending_children = 0;
        self.own_settled = false;
        self.entered = false;
        self.boundary = None;
        self.discarded = false;
    }

    /// Bind a fresh or recycled shell to a producer.
    pub(crate) fn assign(&mut self, producer: Box<dyn Producer>) {
        self.display_name.push_str(producer.name());
        self.producer = Some(producer);
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Resolved markup, present once the node completed as a leaf or was merged.
    pub fn output(&self) -> Option<&Fragment> {
        self.output.as_ref()
    }

    /// The producer is gone and nothing else is pinned by this shell.
    pub fn is_clear(&self) -> bool {
        self.producer.is_none()
            && self.children.is_empty()
            && self.segments.is_empty()
            && self.output.is_none()
            && self.boundary.is_none()
    }
}

impl fmt::Debug for QueueNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("display_name", &self.display_name)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("pending_children", &self.pending_children)
            .finish_non_exhaustive()
    }
}

/// Flush cursor frame: resolving `node`, with `next_segment` segments emitted so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackItem {
    pub node: NodeId,
    pub next_segment: usize,
}

impl StackItem {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next_segment: 0,
        }
    }
}
