//! Per-request node arena and flush cursor.
//!
//! Nodes live in a dense table indexed by [`NodeId`]. The flush cursor walks
//! that table depth-first in document order using a stack of [`StackItem`]s,
//! emitting a node's static segments as soon as they are known and a child's
//! output once the child has completed. Nothing is emitted past the first
//! unresolved position.

use std::mem;

use uuid::Uuid;

use super::error::{CursorDesync, NodeLimitExceeded, OrderingViolation};
use super::node::{NodeId, NodeState, QueueNode, Segment, StackItem};
use super::pool::NodePool;
use super::producer::Fragment;

/// A piece of output handed to the consumer, attributed to the node it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub node: NodeId,
    pub html: Fragment,
}

/// Result of routing a producer failure through the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    /// An enclosing boundary absorbed the failure and now renders its fallback.
    Isolated { boundary: NodeId },
    /// No boundary encloses the failed node; the whole queue must stop.
    /// The chain runs from the failed node up to the root.
    Abort { chain: Vec<NodeId> },
}

pub struct RenderQueue {
    request_id: Uuid,
    nodes: Vec<Option<QueueNode>>,
    cursor: Vec<StackItem>,
    last_flushed: Option<NodeId>,
    last_position: Vec<u32>,
    flush_order: Vec<NodeId>,
    root_flushed: bool,
    completed: usize,
}

impl RenderQueue {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            nodes: Vec::new(),
            cursor: Vec::new(),
            last_flushed: None,
            last_position: Vec::new(),
            flush_order: Vec::new(),
            root_flushed: false,
            completed: 0,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Id the next discovered node receives.
    pub(crate) fn next_id(&self) -> Result<NodeId, NodeLimitExceeded> {
        NodeId::try_from_index(self.nodes.len()).ok_or(NodeLimitExceeded {
            max: NodeId::LIMIT,
        })
    }

    pub(crate) fn insert(&mut self, mut node: QueueNode) -> Result<NodeId, NodeLimitExceeded> {
        let id = self.next_id()?;
        node.id = id;
        self.nodes.push(Some(node));
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&QueueNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut QueueNode> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn take(&mut self, id: NodeId) -> Option<QueueNode> {
        self.nodes.get_mut(id.index()).and_then(Option::take)
    }

    /// Nodes discovered so far, including released ones.
    pub fn created(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes still held by this queue.
    pub fn live(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn flush_order(&self) -> &[NodeId] {
        &self.flush_order
    }

    /// The whole document has been emitted.
    pub fn is_finished(&self) -> bool {
        self.root_flushed
    }

    pub(crate) fn is_discarded(&self, id: NodeId) -> bool {
        self.get(id).is_none_or(|node| node.discarded)
    }

    /// Drop a node the scheduler still referenced after its subtree was discarded.
    pub(crate) fn remove(&mut self, id: NodeId, pool: &NodePool) {
        if let Some(node) = self.take(id) {
            pool.release(node);
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// A producer finished with markup and no children.
    pub(crate) fn complete_leaf(&mut self, id: NodeId, output: Fragment, pool: &NodePool) {
        if let Some(node) = self.get_mut(id) {
            node.segments.clear();
            node.output = Some(output);
            node.own_settled = true;
            node.producer = None;
        }
        self.finish(id, pool);
    }

    /// A producer expanded into segments; the builder has linked the children.
    pub(crate) fn settle_expanded(&mut self, id: NodeId, pool: &NodePool) {
        let ready = match self.get_mut(id) {
            Some(node) => {
                node.own_settled = true;
                node.producer = None;
                if node.pending_children == 0 {
                    true
                } else {
                    node.state = NodeState::Suspended;
                    false
                }
            }
            None => false,
        };
        if ready {
            self.finish(id, pool);
        }
    }

    /// Mark `id` completed and propagate to ancestors whose work is now done.
    fn finish(&mut self, id: NodeId, pool: &NodePool) {
        let mut current = Some(id);
        while let Some(id) = current.take() {
            let Some(node) = self.get_mut(id) else {
                break;
            };
            node.state = NodeState::Completed;
            let parent = node.parent;
            let needs_merge = !node.entered && node.output.is_none();
            self.completed += 1;

            if needs_merge {
                self.merge(id, pool);
            }

            let Some(parent_id) = parent else {
                break;
            };
            if let Some(parent) = self.get_mut(parent_id) {
                parent.pending_children = parent.pending_children.saturating_sub(1);
                if parent.pending_children == 0
                    && parent.own_settled
                    && !parent.discarded
                    && parent.state != NodeState::Completed
                {
                    current = Some(parent_id);
                }
            }
        }
    }

    /// Collapse a completed, not-yet-entered subtree into one fragment.
    fn merge(&mut self, id: NodeId, pool: &NodePool) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        let segments = mem::take(&mut node.segments);

        let mut parts = Vec::with_capacity(segments.len());
        let mut absorbed = Vec::new();
        let mut released = Vec::new();
        for segment in segments {
            match segment {
                Segment::Html(fragment) => parts.push(fragment),
                Segment::Child(child_id) => {
                    if let Some(mut child) = self.take(child_id) {
                        if let Some(output) = child.output.take() {
                            parts.push(output);
                        }
                        absorbed.push(child_id);
                        absorbed.append(&mut child.absorbed);
                        released.push(child);
                    }
                }
            }
        }
        pool.release_all(released);

        let output = match parts.len() {
            0 => Fragment::default(),
            1 => parts.swap_remove(0),
            _ => Fragment::concat(&parts),
        };
        if let Some(node) = self.get_mut(id) {
            node.output = Some(output);
            node.absorbed = absorbed;
            node.children.clear();
        }
    }

    // ------------------------------------------------------------------
    // Failure
    // ------------------------------------------------------------------

    /// Route a producer failure at `id` to the nearest enclosing boundary.
    pub(crate) fn fail(
        &mut self,
        id: NodeId,
        pool: &NodePool,
    ) -> Result<FailureOutcome, CursorDesync> {
        if let Some(node) = self.get_mut(id) {
            node.state = NodeState::Failed;
            node.producer = None;
        }

        let mut boundary = None;
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let Some(node) = self.get(node_id) else {
                break;
            };
            chain.push(node_id);
            if node.boundary.is_some() {
                boundary = Some(node_id);
                break;
            }
            current = node.parent;
        }

        match boundary {
            Some(boundary) => {
                self.isolate(boundary, id, pool)?;
                Ok(FailureOutcome::Isolated { boundary })
            }
            None => {
                for node_id in &chain {
                    if let Some(node) = self.get_mut(*node_id) {
                        node.state = NodeState::Failed;
                    }
                }
                Ok(FailureOutcome::Abort { chain })
            }
        }
    }

    /// Replace whatever `boundary` has not flushed yet with its fallback.
    fn isolate(
        &mut self,
        boundary: NodeId,
        failed: NodeId,
        pool: &NodePool,
    ) -> Result<(), CursorDesync> {
        let Some(node) = self.get(boundary) else {
            return Ok(());
        };
        let frame = if node.entered {
            let frame = self
                .cursor
                .iter()
                .rposition(|item| item.node == boundary)
                .ok_or(CursorDesync { boundary })?;
            Some(frame)
        } else {
            None
        };

        let Some(node) = self.get_mut(boundary) else {
            return Ok(());
        };
        let fallback = node.boundary.clone().unwrap_or_default();
        let children = mem::take(&mut node.children);
        node.pending_children = 0;
        node.own_settled = true;
        node.producer = None;

        if let Some(frame) = frame {
            self.cursor.truncate(frame + 1);
            let flushed = self.cursor.last().map_or(0, |item| item.next_segment);
            if let Some(node) = self.get_mut(boundary) {
                node.segments.truncate(flushed);
                node.segments.push(Segment::Html(fallback));
            }
        } else if let Some(node) = self.get_mut(boundary) {
            node.segments.clear();
            node.output = Some(fallback);
        }

        self.discard_subtree(children, pool);
        if failed != boundary {
            self.remove(failed, pool);
        }
        self.finish(boundary, pool);
        Ok(())
    }

    /// Release every settled descendant and flag the rest so their in-flight
    /// results are dropped on arrival.
    fn discard_subtree(&mut self, roots: Vec<NodeId>, pool: &NodePool) {
        let mut stack = roots;
        while let Some(id) = stack.pop() {
            let Some(node) = self.get_mut(id) else {
                continue;
            };
            stack.extend(node.children.iter().copied());
            if node.own_settled || node.state == NodeState::Failed {
                self.remove(id, pool);
            } else {
                node.discarded = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Move the flush cursor as far as resolved output allows.
    pub(crate) fn advance(&mut self, pool: &NodePool) -> Result<Vec<Chunk>, OrderingViolation> {
        let mut chunks = Vec::new();
        loop {
            let Some(top) = self.cursor.last().copied() else {
                if self.root_flushed || !self.enter_root(pool, &mut chunks)? {
                    break;
                }
                continue;
            };

            let Some(node) = self.get(top.node) else {
                self.cursor.pop();
                continue;
            };

            match node.segments.get(top.next_segment).cloned() {
                Some(Segment::Html(fragment)) => {
                    self.emit(top.node, fragment, &mut chunks);
                    self.step_cursor();
                }
                Some(Segment::Child(child_id)) => {
                    let Some(child) = self.get(child_id) else {
                        self.step_cursor();
                        continue;
                    };
                    if child.output.is_some() {
                        self.flush_completed(child_id, pool, &mut chunks)?;
                        self.step_cursor();
                    } else if child.own_settled {
                        self.record_flush(child_id)?;
                        if let Some(child) = self.get_mut(child_id) {
                            child.entered = true;
                        }
                        self.cursor.push(StackItem::new(child_id));
                    } else {
                        break;
                    }
                }
                None => {
                    if node.state != NodeState::Completed {
                        break;
                    }
                    self.cursor.pop();
                    self.remove(top.node, pool);
                    if top.node == NodeId::ROOT {
                        self.root_flushed = true;
                    } else {
                        self.step_cursor();
                    }
                }
            }
        }
        Ok(chunks)
    }

    fn enter_root(
        &mut self,
        pool: &NodePool,
        chunks: &mut Vec<Chunk>,
    ) -> Result<bool, OrderingViolation> {
        let Some(root) = self.get(NodeId::ROOT) else {
            return Ok(false);
        };
        if root.output.is_some() {
            self.flush_completed(NodeId::ROOT, pool, chunks)?;
            self.root_flushed = true;
            return Ok(false);
        }
        if !root.own_settled {
            return Ok(false);
        }
        self.record_flush(NodeId::ROOT)?;
        if let Some(root) = self.get_mut(NodeId::ROOT) {
            root.entered = true;
        }
        self.cursor.push(StackItem::new(NodeId::ROOT));
        Ok(true)
    }

    fn step_cursor(&mut self) {
        if let Some(top) = self.cursor.last_mut() {
            top.next_segment += 1;
        }
    }

    /// Emit a completed node's whole output and hand its shell back to the pool.
    fn flush_completed(
        &mut self,
        id: NodeId,
        pool: &NodePool,
        chunks: &mut Vec<Chunk>,
    ) -> Result<(), OrderingViolation> {
        self.record_flush(id)?;
        let Some(mut node) = self.take(id) else {
            return Ok(());
        };
        self.flush_order.append(&mut node.absorbed);
        if let Some(output) = node.output.take() {
            self.emit(id, output, chunks);
        }
        pool.release(node);
        Ok(())
    }

    fn emit(&mut self, node: NodeId, html: Fragment, chunks: &mut Vec<Chunk>) {
        if !html.is_empty() {
            chunks.push(Chunk { node, html });
        }
    }

    /// Record that output for `id` starts now; positions must strictly increase.
    pub(crate) fn record_flush(&mut self, id: NodeId) -> Result<(), OrderingViolation> {
        let Some(node) = self.nodes.get(id.index()).and_then(Option::as_ref) else {
            return Ok(());
        };
        if let Some(previous) = self.last_flushed
            && node.path.as_slice() <= self.last_position.as_slice()
        {
            return Err(OrderingViolation { previous, next: id });
        }
        self.last_position.clear();
        self.last_position.extend_from_slice(&node.path);
        self.last_flushed = Some(id);
        self.flush_order.push(id);
        Ok(())
    }

    /// Hand every remaining shell back to the pool.
    pub(crate) fn drain_into(&mut self, pool: &NodePool) {
        self.cursor.clear();
        pool.release_all(self.nodes.iter_mut().filter_map(Option::take));
    }
}

impl std::fmt::Debug for RenderQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderQueue")
            .field("request_id", &self.request_id)
            .field("created", &self.created())
            .field("live", &self.live())
            .field("cursor", &self.cursor)
            .field("last_flushed", &self.last_flushed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::builder::QueueBuilder;
    use crate::queue::pool::PoolConfig;
    use crate::queue::producer::Template;

    fn setup() -> (RenderQueue, NodePool) {
        let pool = NodePool::new(PoolConfig::new(8).expect("valid capacity"));
        (RenderQueue::new(Uuid::nil()), pool)
    }

    fn add_root(queue: &mut RenderQueue, pool: &NodePool) -> NodeId {
        QueueBuilder::new(queue, pool)
            .root(Fragment::from_static("root"))
            .expect("root id")
    }

    fn expand_into(
        queue: &mut RenderQueue,
        pool: &NodePool,
        parent: NodeId,
        template: Template,
    ) -> Vec<NodeId> {
        QueueBuilder::new(queue, pool)
            .expand(parent, template)
            .expect("child ids")
    }

    fn html(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|chunk| chunk.html.as_str()).collect()
    }

    #[test]
    fn prefix_flushes_before_children_resolve() {
        let (mut queue, pool) = setup();
        let root = add_root(&mut queue, &pool);
        let children = expand_into(
            &mut queue,
            &pool,
            root,
            Template::new()
                .html("<ul>")
                .child(Fragment::from_static("a"))
                .child(Fragment::from_static("b"))
                .html("</ul>"),
        );
        queue.settle_expanded(root, &pool);

        let chunks = queue.advance(&pool).expect("ordered");
        assert_eq!(html(&chunks), ["<ul>"]);

        // The later sibling resolves first and stays buffered.
        queue.complete_leaf(children[1], Fragment::from_static("<li>b</li>"), &pool);
        assert!(queue.advance(&pool).expect("ordered").is_empty());

        queue.complete_leaf(children[0], Fragment::from_static("<li>a</li>"), &pool);
        let chunks = queue.advance(&pool).expect("ordered");
        assert_eq!(html(&chunks), ["<li>a</li>", "<li>b</li>", "</ul>"]);
        assert!(queue.is_finished());
        assert_eq!(queue.flush_order(), [root, children[0], children[1]]);
        assert_eq!(queue.live(), 0);
    }

    #[test]
    fn completed_subtree_is_merged_before_flush() {
        let (mut queue, pool) = setup();
        let root = add_root(&mut queue, &pool);
        let outer = expand_into(
            &mut queue,
            &pool,
            root,
            Template::new()
                .child(Fragment::from_static("first"))
                .child(Fragment::from_static("second")),
        );
        queue.settle_expanded(root, &pool);
        assert!(queue.advance(&pool).expect("ordered").is_empty());

        let inner = expand_into(
            &mut queue,
            &pool,
            outer[1],
            Template::new()
                .html("<section>")
                .child(Fragment::from_static("leaf"))
                .html("</section>"),
        );
        queue.settle_expanded(outer[1], &pool);
        queue.complete_leaf(inner[0], Fragment::from_static("text"), &pool);

        let merged = queue.get(outer[1]).and_then(QueueNode::output).cloned();
        assert_eq!(merged, Some(Fragment::from_static("<section>text</section>")));
        assert!(queue.get(inner[0]).is_none());

        queue.complete_leaf(outer[0], Fragment::from_static("<p>"), &pool);
        let chunks = queue.advance(&pool).expect("ordered");
        assert_eq!(html(&chunks), ["<p>", "<section>text</section>"]);
        assert_eq!(queue.flush_order(), [root, outer[0], outer[1], inner[0]]);
        assert!(queue.is_finished());
    }

    #[test]
    fn failure_without_boundary_marks_chain_failed() {
        let (mut queue, pool) = setup();
        let root = add_root(&mut queue, &pool);
        let children = expand_into(
            &mut queue,
            &pool,
            root,
            Template::new()
                .child(Fragment::from_static("ok"))
                .child(Fragment::from_static("broken")),
        );
        queue.settle_expanded(root, &pool);

        let outcome = queue.fail(children[1], &pool).expect("cursor in sync");
        assert_eq!(
            outcome,
            FailureOutcome::Abort {
                chain: vec![children[1], root]
            }
        );
        assert_eq!(queue.get(root).map(QueueNode::state), Some(NodeState::Failed));

        queue.drain_into(&pool);
        assert_eq!(queue.live(), 0);
    }

    #[test]
    fn boundary_replaces_unflushed_output_with_fallback() {
        let (mut queue, pool) = setup();
        let root = add_root(&mut queue, &pool);
        let children = expand_into(
            &mut queue,
            &pool,
            root,
            Template::new()
                .html("<main>")
                .boundary(Fragment::from_static("widget"), "<p>unavailable</p>")
                .html("</main>"),
        );
        queue.settle_expanded(root, &pool);
        let widget = children[0];
        assert_eq!(html(&queue.advance(&pool).expect("ordered")), ["<main>"]);

        let inner = expand_into(
            &mut queue,
            &pool,
            widget,
            Template::new()
                .child(Fragment::from_static("fine"))
                .child(Fragment::from_static("broken")),
        );
        queue.settle_expanded(widget, &pool);
        queue.complete_leaf(inner[0], Fragment::from_static("<b>partial</b>"), &pool);

        let outcome = queue.fail(inner[1], &pool).expect("cursor in sync");
        assert_eq!(outcome, FailureOutcome::Isolated { boundary: widget });

        let chunks = queue.advance(&pool).expect("ordered");
        assert_eq!(html(&chunks), ["<p>unavailable</p>", "</main>"]);
        assert!(queue.is_finished());
        assert_eq!(queue.live(), 0);
    }

    #[test]
    fn boundary_keeps_output_that_already_streamed() {
        let (mut queue, pool) = setup();
        let root = add_root(&mut queue, &pool);
        let children = expand_into(
            &mut queue,
            &pool,
            root,
            Template::new().boundary(Fragment::from_static("widget"), "[fallback]"),
        );
        queue.settle_expanded(root, &pool);
        let widget = children[0];
        let inner = expand_into(
            &mut queue,
            &pool,
            widget,
            Template::new()
                .html("<div>")
                .child(Fragment::from_static("slow")),
        );
        queue.settle_expanded(widget, &pool);

        let chunks = queue.advance(&pool).expect("ordered");
        assert_eq!(html(&chunks), ["<div>"]);

        queue.fail(inner[0], &pool).expect("cursor in sync");
        let chunks = queue.advance(&pool).expect("ordered");
        assert_eq!(html(&chunks), ["[fallback]"]);
        assert!(queue.is_finished());
    }

    #[test]
    fn entered_boundary_missing_from_cursor_is_reported() {
        let (mut queue, pool) = setup();
        let root = add_root(&mut queue, &pool);
        let children = expand_into(
            &mut queue,
            &pool,
            root,
            Template::new().boundary(Fragment::from_static("widget"), "[fallback]"),
        );
        queue.settle_expanded(root, &pool);
        let widget = children[0];
        let inner = expand_into(
            &mut queue,
            &pool,
            widget,
            Template::new()
                .html("<div>")
                .child(Fragment::from_static("slow")),
        );
        queue.settle_expanded(widget, &pool);
        assert_eq!(html(&queue.advance(&pool).expect("ordered")), ["<div>"]);

        queue.cursor.clear();
        let desync = queue.fail(inner[0], &pool).expect_err("cursor lost the boundary");
        assert_eq!(desync, CursorDesync { boundary: widget });
        assert_eq!(queue.get(widget).map(|node| node.children().len()), Some(1));
    }

    #[test]
    fn in_flight_descendants_are_flagged_not_released() {
        let (mut queue, pool) = setup();
        let root = add_root(&mut queue, &pool);
        let children = expand_into(
            &mut queue,
            &pool,
            root,
            Template::new().boundary(Fragment::from_static("widget"), ""),
        );
        queue.settle_expanded(root, &pool);
        let inner = expand_into(
            &mut queue,
            &pool,
            children[0],
            Template::new()
                .child(Fragment::from_static("pending"))
                .child(Fragment::from_static("broken")),
        );
        queue.settle_expanded(children[0], &pool);

        queue.fail(inner[1], &pool).expect("cursor in sync");
        assert!(queue.is_discarded(inner[0]));
        assert!(queue.get(inner[0]).is_some());
        queue.remove(inner[0], &pool);
        assert!(queue.get(inner[0]).is_none());
    }

    #[test]
    fn out_of_order_flush_is_detected() {
        let (mut queue, pool) = setup();
        let root = add_root(&mut queue, &pool);
        let children = expand_into(
            &mut queue,
            &pool,
            root,
            Template::new()
                .child(Fragment::from_static("a"))
                .child(Fragment::from_static("b")),
        );

        queue.record_flush(children[1]).expect("first flush");
        let violation = queue.record_flush(children[0]).expect_err("must be rejected");
        assert_eq!(
            violation,
            OrderingViolation {
                previous: children[1],
                next: children[0],
            }
        );
    }
}
