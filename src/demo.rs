//! Synthetic page used by the `demo` command: a layout with a list of cards,
//! each card awaiting a simulated data fetch before expanding into markup.
//!
//! Card delays cycle through one to three times the base delay, so later
//! cards regularly finish before earlier ones while the stream stays in
//! document order.

use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;

use crate::config::DemoArgs;
use crate::queue::{
    NodePool, Producer, ProducerError, QueueRenderer, Render, RenderContext, RenderFailure,
    RenderOptions, RenderReport, Template,
};

const CARD_FALLBACK: &str = "<li class=\"card card--unavailable\">unavailable</li>";

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub requests: usize,
    pub components: u32,
    pub delay: Duration,
    pub timeout: Option<Duration>,
}

impl From<&DemoArgs> for DemoOptions {
    fn from(args: &DemoArgs) -> Self {
        Self {
            requests: usize::try_from(args.requests).unwrap_or(usize::MAX),
            components: args.components,
            delay: Duration::from_millis(args.delay_ms),
            timeout: args.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Result of one demo request.
#[derive(Debug)]
pub struct DemoRequest {
    pub document: Result<String, RenderFailure>,
    pub report: RenderReport,
}

/// Render the demo page `options.requests` times concurrently over `pool`.
pub async fn run(pool: &NodePool, options: &DemoOptions) -> Vec<DemoRequest> {
    let mut render_options = RenderOptions::new();
    if let Some(timeout) = options.timeout {
        render_options = render_options.timeout(timeout);
    }
    let renderer = QueueRenderer::new(pool.clone(), render_options);

    let requests = (0..options.requests).map(|_| {
        let page = DemoPage {
            components: options.components,
            delay: options.delay,
        };
        render_request(&renderer, page)
    });
    join_all(requests).await
}

async fn render_request(renderer: &QueueRenderer, page: DemoPage) -> DemoRequest {
    let mut stream = renderer.render(page);
    let mut html = String::new();
    let document = loop {
        match stream.next().await {
            Some(Ok(chunk)) => html.push_str(chunk.html.as_str()),
            Some(Err(failure)) => break Err(failure),
            None => break Ok(html),
        }
    };
    DemoRequest {
        document,
        report: stream.report(),
    }
}

pub struct DemoPage {
    pub components: u32,
    pub delay: Duration,
}

impl Producer for DemoPage {
    fn name(&self) -> &str {
        "DemoPage"
    }

    fn render(&self, cx: &RenderContext<'_>) -> Result<Render, ProducerError> {
        let mut page = Template::new()
            .html("<!doctype html><html><head><title>render-queue demo</title></head><body>")
            .html(cx.intern("<main>"))
            .html(cx.intern("<ul>"));
        for index in 0..self.components {
            page = page.boundary(
                Card {
                    index,
                    delay: self.delay,
                },
                CARD_FALLBACK,
            );
        }
        Ok(page
            .html(cx.intern("</ul>"))
            .html(cx.intern("</main>"))
            .html("</body></html>")
            .into())
    }
}

struct Card {
    index: u32,
    delay: Duration,
}

impl Producer for Card {
    fn name(&self) -> &str {
        "Card"
    }

    fn render(&self, cx: &RenderContext<'_>) -> Result<Render, ProducerError> {
        let index = self.index;
        let delay = self.delay * (index % 3 + 1);
        let pool = cx.pool().clone();

        Ok(Render::awaiting(async move {
            tokio::time::sleep(delay).await;
            Ok(Template::new()
                .html(pool.intern("<li>"))
                .child(CardTitle { index })
                .html(pool.intern("<p>"))
                .html(format!("Fetched after {} ms", delay.as_millis()))
                .html(pool.intern("</p>"))
                .html(pool.intern("</li>"))
                .into())
        }))
    }
}

struct CardTitle {
    index: u32,
}

impl Producer for CardTitle {
    fn name(&self) -> &str {
        "CardTitle"
    }

    fn render(&self, _cx: &RenderContext<'_>) -> Result<Render, ProducerError> {
        Ok(Render::done(format!("<h3>Card {}</h3>", self.index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{PoolConfig, RenderOutcome};

    #[tokio::test]
    async fn demo_documents_are_identical_and_ordered() {
        let pool = NodePool::new(PoolConfig::new(3).expect("valid capacity"));
        let options = DemoOptions {
            requests: 3,
            components: 5,
            delay: Duration::from_millis(2),
            timeout: None,
        };

        let results = run(&pool, &options).await;
        assert_eq!(results.len(), 3);

        let documents: Vec<&str> = results
            .iter()
            .map(|request| request.document.as_deref().expect("render succeeds"))
            .collect();
        assert!(documents.windows(2).all(|pair| pair[0] == pair[1]));

        let document = documents[0];
        let positions: Vec<usize> = (0..5)
            .map(|index| {
                document
                    .find(&format!("<h3>Card {index}</h3>"))
                    .expect("card present")
            })
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(document.starts_with("<!doctype html>"));
        assert!(document.ends_with("</body></html>"));

        for request in &results {
            assert_eq!(request.report.outcome, RenderOutcome::Completed);
            assert!(request.report.slots_high_watermark <= 3);
        }
        assert_eq!(pool.slots_in_use(), 0);
        assert!(pool.high_watermark() <= 3);
    }

    #[tokio::test]
    async fn demo_timeout_cancels_requests() {
        let pool = NodePool::new(PoolConfig::new(4).expect("valid capacity"));
        let options = DemoOptions {
            requests: 1,
            components: 2,
            delay: Duration::from_secs(5),
            timeout: Some(Duration::from_millis(20)),
        };

        let results = run(&pool, &options).await;
        let failure = results[0].document.as_ref().expect_err("must time out");
        assert!(failure.is_cancelled());
        assert_eq!(results[0].report.outcome, RenderOutcome::Cancelled);
        assert_eq!(pool.slots_in_use(), 0);
    }
}
