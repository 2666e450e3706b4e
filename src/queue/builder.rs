//! Links lazily discovered producers into the render queue.
//!
//! Discovery and execution interleave: the scheduler runs a producer, and
//! when it answers with a [`Template`] the builder immediately allocates one
//! node per child (shells come from the pool), assigns sequential ids in call
//! order, and records each child's document position before control returns.

use tracing::trace;

use super::error::NodeLimitExceeded;
use super::node::{NodeId, QueueNode, Segment};
use super::pool::NodePool;
use super::producer::{Fragment, Part, Producer, Template};
use super::render_queue::RenderQueue;

pub struct QueueBuilder<'a> {
    queue: &'a mut RenderQueue,
    pool: &'a NodePool,
}

impl<'a> QueueBuilder<'a> {
    pub fn new(queue: &'a mut RenderQueue, pool: &'a NodePool) -> Self {
        Self { queue, pool }
    }

    /// Create the root node for a render request.
    pub fn root(self, producer: impl Producer) -> Result<NodeId, NodeLimitExceeded> {
        self.root_boxed(Box::new(producer))
    }

    pub fn root_boxed(self, producer: Box<dyn Producer>) -> Result<NodeId, NodeLimitExceeded> {
        self.queue.next_id()?;
        let mut node = self.pool.acquire_shell();
        node.assign(producer);
        self.queue.insert(node)
    }

    /// Attach the template's children to `parent`, returning their ids in
    /// document order. The parent's segments interleave its static markup
    /// with placeholders for those children.
    pub fn expand(
        mut self,
        parent: NodeId,
        template: Template,
    ) -> Result<Vec<NodeId>, NodeLimitExceeded> {
        let Some(parent_node) = self.queue.get_mut(parent) else {
            return Ok(Vec::new());
        };
        let mut path = std::mem::take(&mut parent_node.path);
        let mut segments = std::mem::take(&mut parent_node.segments);
        let mut children = std::mem::take(&mut parent_node.children);
        segments.clear();
        children.clear();

        for part in template.into_parts() {
            let (producer, boundary) = match part {
                Part::Html(fragment) => {
                    segments.push(Segment::Html(fragment));
                    continue;
                }
                Part::Child(producer) => (producer, None),
                Part::Boundary { producer, fallback } => (producer, Some(fallback)),
            };

            let index = u32::try_from(children.len()).unwrap_or(u32::MAX);
            path.push(index);
            let child = self.spawn(parent, &path, producer, boundary);
            path.pop();
            let child = child?;

            children.push(child);
            segments.push(Segment::Child(child));
        }

        let discovered = children.clone();
        if let Some(parent_node) = self.queue.get_mut(parent) {
            parent_node.path = path;
            parent_node.segments = segments;
            parent_node.pending_children = children.len();
            parent_node.children = children;
        }
        Ok(discovered)
    }

    fn spawn(
        &mut self,
        parent: NodeId,
        path: &[u32],
        producer: Box<dyn Producer>,
        boundary: Option<Fragment>,
    ) -> Result<NodeId, NodeLimitExceeded> {
        self.queue.next_id()?;
        let mut node: QueueNode = self.pool.acquire_shell();
        node.assign(producer);
        node.parent = Some(parent);
        node.path.extend_from_slice(path);
        node.boundary = boundary;
        let id = self.queue.insert(node)?;
        trace!(
            request_id = %self.queue.request_id(),
            node = %id,
            parent = %parent,
            depth = path.len(),
            "Discovered child node"
        );
        Ok(id)
    }
}
