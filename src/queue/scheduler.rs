//! Queued rendering scheduler.
//!
//! One [`Scheduler`] drives one render request. It runs ready nodes while the
//! shared pool has free slots, parks nodes that await external values, links
//! children discovered by expanding producers, and moves the flush cursor
//! after every settlement. Execution order follows readiness; output order
//! always follows the document.
//!
//! The public face is [`QueueRenderer::render`], which returns a
//! [`RenderStream`]. The stream only makes progress while it is polled, so a
//! slow consumer throttles the whole render.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::builder::QueueBuilder;
use super::error::{
    CancelReason, CancellationError, FlushBoundary, NodeLimitExceeded, PoolClosed, ProducerError,
    RenderFailure, RenderFailureKind,
};
use super::lock::mutex_lock;
use super::metric_names;
use super::node::{NodeId, NodeState};
use super::pool::{NodePool, PoolSlot};
use super::producer::{Producer, Render, RenderContext};
use super::render_queue::{Chunk, FailureOutcome, RenderQueue};

const SOURCE: &str = "queue::scheduler";

/// Cloneable handle that aborts a render from outside, e.g. on client disconnect.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`CancelHandle::cancel`] has been called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    timeout: Option<Duration>,
    cancel: Option<CancelHandle>,
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the whole request once `timeout` has elapsed since it started.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tie the render to an externally owned cancel handle.
    pub fn cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel = Some(handle);
        self
    }
}

/// How a render ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderOutcome {
    #[default]
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RenderOutcome {
    fn as_str(self) -> &'static str {
        match self {
            RenderOutcome::InProgress => "in_progress",
            RenderOutcome::Completed => "completed",
            RenderOutcome::Failed => "failed",
            RenderOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RenderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one render request, filled in when the render ends.
#[derive(Debug, Clone, Default)]
pub struct RenderReport {
    pub request_id: Uuid,
    pub outcome: RenderOutcome,
    pub nodes_created: usize,
    pub nodes_completed: usize,
    pub isolated_failures: usize,
    pub chunks: usize,
    pub bytes: usize,
    /// Most pool slots this request held at once.
    pub slots_high_watermark: usize,
    /// Nodes in the order their output reached the stream.
    pub flush_order: Vec<NodeId>,
    /// Failed node followed by its ancestors, when a failure aborted the render.
    pub failed_chain: Vec<NodeId>,
    pub elapsed: Duration,
}

/// Renders producer trees over a shared [`NodePool`].
#[derive(Clone)]
pub struct QueueRenderer {
    pool: NodePool,
    options: RenderOptions,
}

impl QueueRenderer {
    pub fn new(pool: NodePool, options: RenderOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    /// Start rendering `root` with the renderer's default options.
    pub fn render(&self, root: impl Producer) -> RenderStream {
        self.render_with(root, self.options.clone())
    }

    pub fn render_with(&self, root: impl Producer, options: RenderOptions) -> RenderStream {
        let request_id = Uuid::new_v4();
        let cancel = options.cancel.unwrap_or_default();
        let report = Arc::new(Mutex::new(RenderReport {
            request_id,
            ..RenderReport::default()
        }));

        let mut scheduler = Scheduler::new(
            request_id,
            self.pool.clone(),
            cancel.clone(),
            options.timeout,
            Arc::clone(&report),
        );
        let seeded = scheduler.seed(Box::new(root));

        let inner = async_stream::stream! {
            let mut scheduler = scheduler;
            if let Err(limit) = seeded {
                yield Err(scheduler.abort(limit.into()));
                return;
            }
            'render: loop {
                match scheduler.next_step().await {
                    Step::Chunks(chunks) => {
                        for chunk in chunks {
                            if let Some(reason) = scheduler.interrupted() {
                                yield Err(scheduler.abort(CancellationError::new(reason).into()));
                                break 'render;
                            }
                            scheduler.delivered(&chunk);
                            yield Ok(chunk);
                        }
                    }
                    Step::Finished => break 'render,
                    Step::Failed(failure) => {
                        yield Err(failure);
                        break 'render;
                    }
                }
            }
        };

        RenderStream {
            request_id,
            inner: Box::pin(inner),
            report,
            cancel,
        }
    }

    /// Render `root` to completion and collect the document.
    pub async fn render_to_string(&self, root: impl Producer) -> Result<String, RenderFailure> {
        let mut stream = self.render(root);
        let mut html = String::new();
        while let Some(chunk) = stream.next().await {
            html.push_str(chunk?.html.as_str());
        }
        Ok(html)
    }
}

/// Ordered output of one render request.
///
/// Yields chunks in document order and ends after the last chunk, or with a
/// single [`RenderFailure`] describing the cause and how much was delivered.
/// Dropping the stream cancels the render and returns its nodes to the pool.
pub struct RenderStream {
    request_id: Uuid,
    inner: Pin<Box<dyn Stream<Item = Result<Chunk, RenderFailure>> + Send>>,
    report: Arc<Mutex<RenderReport>>,
    cancel: CancelHandle,
}

impl RenderStream {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Snapshot of the request summary; complete once the stream has ended.
    pub fn report(&self) -> RenderReport {
        mutex_lock(&self.report, SOURCE, "report").clone()
    }
}

impl Stream for RenderStream {
    type Item = Result<Chunk, RenderFailure>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for RenderStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderStream")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// A parked node whose awaited value has arrived. The slot it held while
/// waiting is carried along and released once the result is applied.
struct Settled {
    node: NodeId,
    result: Result<Render, ProducerError>,
    slot: PoolSlot,
}

enum Step {
    Chunks(Vec<Chunk>),
    Finished,
    Failed(RenderFailure),
}

enum Wake {
    Cancelled,
    TimedOut,
    Settled(Settled),
    Slot(Result<PoolSlot, PoolClosed>),
}

struct Scheduler {
    request_id: Uuid,
    pool: NodePool,
    queue: RenderQueue,
    ready: VecDeque<NodeId>,
    in_flight: FuturesUnordered<BoxFuture<'static, Settled>>,
    cancel: CancelHandle,
    deadline: Option<Instant>,
    started: Instant,
    slots_high_watermark: usize,
    isolated_failures: usize,
    failed_chain: Vec<NodeId>,
    boundary: FlushBoundary,
    report: Arc<Mutex<RenderReport>>,
    finished: bool,
}

impl Scheduler {
    fn new(
        request_id: Uuid,
        pool: NodePool,
        cancel: CancelHandle,
        timeout: Option<Duration>,
        report: Arc<Mutex<RenderReport>>,
    ) -> Self {
        let started = Instant::now();
        Self {
            request_id,
            pool,
            queue: RenderQueue::new(request_id),
            ready: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            cancel,
            deadline: timeout.map(|timeout| started + timeout),
            started,
            slots_high_watermark: 0,
            isolated_failures: 0,
            failed_chain: Vec::new(),
            boundary: FlushBoundary::default(),
            report,
            finished: false,
        }
    }

    fn seed(&mut self, root: Box<dyn Producer>) -> Result<(), NodeLimitExceeded> {
        let root = QueueBuilder::new(&mut self.queue, &self.pool).root_boxed(root)?;
        self.ready.push_back(root);
        debug!(
            request_id = %self.request_id,
            capacity = self.pool.capacity(),
            bounded = self.pool.is_bounded(),
            "Render request queued"
        );
        Ok(())
    }

    async fn next_step(&mut self) -> Step {
        loop {
            if self.finished {
                return Step::Finished;
            }
            if self.queue.is_finished() {
                self.finalize(RenderOutcome::Completed);
                return Step::Finished;
            }
            if let Some(reason) = self.interrupted() {
                return Step::Failed(self.abort(CancellationError::new(reason).into()));
            }

            match self.queue.advance(&self.pool) {
                Ok(chunks) if !chunks.is_empty() => return Step::Chunks(chunks),
                Ok(_) => {}
                Err(violation) => return Step::Failed(self.abort(violation.into())),
            }
            if self.queue.is_finished() {
                self.finalize(RenderOutcome::Completed);
                return Step::Finished;
            }

            match self.start_ready() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(kind) => return Step::Failed(self.abort(kind)),
            }
            if self.ready.is_empty() && self.in_flight.is_empty() {
                let unresolved = self.queue.live();
                return Step::Failed(self.abort(RenderFailureKind::Stalled { unresolved }));
            }

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = deadline_elapsed(self.deadline) => Wake::TimedOut,
                Some(settled) = self.in_flight.next() => Wake::Settled(settled),
                slot = self.pool.acquire_slot(), if !self.ready.is_empty() => Wake::Slot(slot),
            };

            let result = match wake {
                Wake::Cancelled => Err(CancellationError::new(CancelReason::Aborted).into()),
                Wake::TimedOut => Err(CancellationError::new(CancelReason::TimedOut).into()),
                Wake::Settled(settled) => self.settle(settled),
                Wake::Slot(Ok(slot)) => self.dispatch_next(slot),
                Wake::Slot(Err(PoolClosed)) => {
                    Err(CancellationError::new(CancelReason::PoolClosed).into())
                }
            };
            if let Err(kind) = result {
                return Step::Failed(self.abort(kind));
            }
        }
    }

    /// Why the render must stop now, if it must.
    fn interrupted(&self) -> Option<CancelReason> {
        if self.cancel.is_cancelled() {
            return Some(CancelReason::Aborted);
        }
        if self
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Some(CancelReason::TimedOut);
        }
        None
    }

    /// Start the next ready node if a slot is free right now. Returns whether
    /// any progress was made.
    fn start_ready(&mut self) -> Result<bool, RenderFailureKind> {
        let Some(&id) = self.ready.front() else {
            return Ok(false);
        };
        if self.queue.is_discarded(id) {
            self.ready.pop_front();
            self.queue.remove(id, &self.pool);
            return Ok(true);
        }
        match self.pool.try_acquire_slot() {
            Ok(Some(slot)) => {
                self.ready.pop_front();
                self.dispatch(id, slot)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(PoolClosed) => Err(CancellationError::new(CancelReason::PoolClosed).into()),
        }
    }

    /// Use a slot obtained by waiting for the first live ready node.
    fn dispatch_next(&mut self, slot: PoolSlot) -> Result<(), RenderFailureKind> {
        while let Some(id) = self.ready.pop_front() {
            if self.queue.is_discarded(id) {
                self.queue.remove(id, &self.pool);
                continue;
            }
            return self.dispatch(id, slot);
        }
        Ok(())
    }

    /// Run a node's producer while holding `slot`.
    fn dispatch(&mut self, id: NodeId, slot: PoolSlot) -> Result<(), RenderFailureKind> {
        let held = self.in_flight.len() + 1;
        self.slots_high_watermark = self.slots_high_watermark.max(held);

        let Some(node) = self.queue.get_mut(id) else {
            return Ok(());
        };
        node.state = NodeState::Running;
        let cx = RenderContext::new(self.request_id, node.depth(), &self.pool);
        let result = match node.producer.as_ref() {
            Some(producer) => producer.render(&cx),
            None => Err(ProducerError::new("node has no producer")),
        };
        debug!(
            request_id = %self.request_id,
            node = %id,
            component = node.display_name(),
            depth = node.depth(),
            slots_held = held,
            "Dispatched node"
        );

        self.apply(id, result, slot)
    }

    fn settle(&mut self, settled: Settled) -> Result<(), RenderFailureKind> {
        let Settled { node, result, slot } = settled;
        if self.queue.is_discarded(node) {
            self.queue.remove(node, &self.pool);
            trace!(request_id = %self.request_id, node = %node, "Dropped result of discarded node");
            return Ok(());
        }
        trace!(request_id = %self.request_id, node = %node, "Resumed node");
        self.apply(node, result, slot)
    }

    fn apply(
        &mut self,
        id: NodeId,
        result: Result<Render, ProducerError>,
        slot: PoolSlot,
    ) -> Result<(), RenderFailureKind> {
        match result {
            Ok(Render::Done(fragment)) => {
                drop(slot);
                self.queue.complete_leaf(id, fragment, &self.pool);
                Ok(())
            }
            Ok(Render::Expanded(template)) => {
                drop(slot);
                let children =
                    QueueBuilder::new(&mut self.queue, &self.pool).expand(id, template)?;
                for child in children.iter().rev() {
                    self.ready.push_front(*child);
                }
                self.queue.settle_expanded(id, &self.pool);
                Ok(())
            }
            Ok(Render::Awaiting(future)) => {
                if let Some(node) = self.queue.get_mut(id) {
                    node.state = NodeState::Suspended;
                }
                trace!(request_id = %self.request_id, node = %id, "Suspended node");
                self.in_flight.push(Box::pin(async move {
                    Settled {
                        node: id,
                        result: future.await,
                        slot,
                    }
                }));
                Ok(())
            }
            Err(error) => {
                drop(slot);
                self.fail(id, error)
            }
        }
    }

    fn fail(&mut self, id: NodeId, error: ProducerError) -> Result<(), RenderFailureKind> {
        let component = self
            .queue
            .get(id)
            .map(|node| node.display_name().to_owned())
            .unwrap_or_default();
        let error = error.attribute_to(&component);

        match self.queue.fail(id, &self.pool)? {
            FailureOutcome::Isolated { boundary } => {
                self.isolated_failures += 1;
                warn!(
                    request_id = %self.request_id,
                    node = %id,
                    boundary = %boundary,
                    component = %error.component,
                    error = %error.message,
                    "Producer failed inside boundary; rendering fallback"
                );
                Ok(())
            }
            FailureOutcome::Abort { chain } => {
                warn!(
                    request_id = %self.request_id,
                    node = %id,
                    component = %error.component,
                    error = %error.message,
                    depth = chain.len().saturating_sub(1),
                    "Producer failed; aborting render"
                );
                self.failed_chain = chain;
                Err(error.into())
            }
        }
    }

    fn delivered(&mut self, chunk: &Chunk) {
        self.boundary.chunks += 1;
        self.boundary.bytes += chunk.html.len();
        self.boundary.last_node = Some(chunk.node);
        counter!(metric_names::CHUNKS_FLUSHED_TOTAL).increment(1);
    }

    /// Stop the render: parked futures are dropped (freeing their slots) and
    /// every node returns to the pool.
    fn abort(&mut self, kind: RenderFailureKind) -> RenderFailure {
        let outcome = match &kind {
            RenderFailureKind::Cancelled(cancellation) => {
                info!(
                    request_id = %self.request_id,
                    reason = %cancellation.reason,
                    chunks = self.boundary.chunks,
                    in_flight = self.in_flight.len(),
                    "Render cancelled"
                );
                RenderOutcome::Cancelled
            }
            _ => RenderOutcome::Failed,
        };

        self.ready.clear();
        self.in_flight = FuturesUnordered::new();
        self.finalize(outcome);
        self.queue.drain_into(&self.pool);
        RenderFailure::new(kind, self.boundary)
    }

    fn finalize(&mut self, outcome: RenderOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        let elapsed = self.started.elapsed();

        {
            let mut report = mutex_lock(&self.report, SOURCE, "finalize");
            report.outcome = outcome;
            report.nodes_created = self.queue.created();
            report.nodes_completed = self.queue.completed();
            report.isolated_failures = self.isolated_failures;
            report.chunks = self.boundary.chunks;
            report.bytes = self.boundary.bytes;
            report.slots_high_watermark = self.slots_high_watermark;
            report.flush_order = self.queue.flush_order().to_vec();
            report.failed_chain = std::mem::take(&mut self.failed_chain);
            report.elapsed = elapsed;
        }

        counter!(metric_names::RENDER_TOTAL, "outcome" => outcome.as_str()).increment(1);
        histogram!(metric_names::RENDER_MS).record(elapsed.as_secs_f64() * 1000.0);
        info!(
            request_id = %self.request_id,
            outcome = %outcome,
            nodes = self.queue.created(),
            chunks = self.boundary.chunks,
            bytes = self.boundary.bytes,
            slots_high_watermark = self.slots_high_watermark,
            elapsed_ms = elapsed.as_millis() as u64,
            "Render finished"
        );
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.finished {
            self.in_flight = FuturesUnordered::new();
            self.finalize(RenderOutcome::Cancelled);
        }
        self.queue.drain_into(&self.pool);
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::pool::PoolConfig;
    use crate::queue::producer::{Fragment, Template, component};

    fn renderer(capacity: i64) -> QueueRenderer {
        let pool = NodePool::new(PoolConfig::new(capacity).expect("valid capacity"));
        QueueRenderer::new(pool, RenderOptions::default())
    }

    #[tokio::test]
    async fn leaf_root_renders_single_chunk() {
        let renderer = renderer(1);
        let html = renderer
            .render_to_string(Fragment::from_static("<p>hello</p>"))
            .await
            .expect("render succeeds");
        assert_eq!(html, "<p>hello</p>");
        assert_eq!(renderer.pool().slots_in_use(), 0);
    }

    #[tokio::test]
    async fn awaited_values_resume_the_node() {
        let renderer = renderer(2);
        let page = component("Page", |_cx| {
            Ok(Render::awaiting(async {
                tokio::task::yield_now().await;
                Ok(Template::new()
                    .html("<main>")
                    .child(component("Late", |_cx| {
                        Ok(Render::awaiting(async { Ok(Render::done("late")) }))
                    }))
                    .html("</main>")
                    .into())
            }))
        });

        let html = renderer.render_to_string(page).await.expect("render");
        assert_eq!(html, "<main>late</main>");
    }

    #[tokio::test]
    async fn report_is_filled_when_stream_ends() {
        let renderer = renderer(4);
        let list = component("List", |_cx| {
            Ok(Template::new()
                .html("<ul>")
                .children(["<li>1</li>", "<li>2</li>"].map(Fragment::from_static))
                .html("</ul>")
                .into())
        });
        let mut stream = renderer.render(list);
        while let Some(chunk) = stream.next().await {
            chunk.expect("chunk");
        }

        let report = stream.report();
        assert_eq!(report.outcome, RenderOutcome::Completed);
        assert_eq!(report.nodes_created, 3);
        assert_eq!(report.nodes_completed, 3);
        assert_eq!(report.chunks, 4);
        assert_eq!(report.bytes, "<ul><li>1</li><li>2</li></ul>".len());
        assert_eq!(report.flush_order.len(), 3);
    }

    #[tokio::test]
    async fn producers_see_request_and_depth() {
        let renderer = renderer(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let root = {
            let seen = Arc::clone(&seen);
            component("Outer", move |cx| {
                seen.lock().expect("seen lock").push((cx.request_id(), cx.depth()));
                let seen = Arc::clone(&seen);
                Ok(Template::new()
                    .child(component("Inner", move |cx| {
                        seen.lock().expect("seen lock").push((cx.request_id(), cx.depth()));
                        Ok(Render::done("<i></i>"))
                    }))
                    .into())
            })
        };

        let mut stream = renderer.render(root);
        while let Some(chunk) = stream.next().await {
            chunk.expect("chunk");
        }

        let request_id = stream.request_id();
        assert_eq!(
            *seen.lock().expect("seen lock"),
            [(request_id, 0), (request_id, 1)]
        );
    }

    #[tokio::test]
    async fn producer_error_is_attributed_to_component() {
        let renderer = renderer(2);
        let root = component("Layout", |_cx| {
            Ok(Template::new()
                .child(component("Broken", |_cx| Err(ProducerError::new("no data"))))
                .into())
        });

        let failure = renderer.render_to_string(root).await.expect_err("must fail");
        let error = failure.producer_error().expect("producer failure");
        assert_eq!(error.component, "Broken");
        assert_eq!(error.message, "no data");
        assert_eq!(renderer.pool().slots_in_use(), 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_parked_slots() {
        let renderer = renderer(2);
        let root = component("Slow", |_cx| {
            Ok(Render::awaiting(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Render::done("never"))
            }))
        });

        let mut stream = renderer.render(root);
        let pending = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(pending.is_err(), "render should still be waiting");
        assert_eq!(renderer.pool().slots_in_use(), 1);

        let report = stream.report();
        assert_eq!(report.outcome, RenderOutcome::InProgress);
        drop(stream);
        assert_eq!(renderer.pool().slots_in_use(), 0);
    }
}
