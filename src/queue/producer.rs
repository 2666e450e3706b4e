//! Boundary between the scheduling core and whatever generates markup.
//!
//! A [`Producer`] is invoked once per queue node. It answers with a tagged
//! [`Render`] value: a finished fragment, a [`Template`] interleaving static
//! markup with child producers, or a future that resolves to one of those.

use std::fmt;
use std::future::Future;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use uuid::Uuid;

use super::error::ProducerError;
use super::pool::NodePool;

/// Display name of producers that do not name themselves.
pub const ANONYMOUS: &str = "Anonymous";

/// An immutable piece of rendered markup. Cloning is reference-counted.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Fragment(Bytes);

impl Fragment {
    pub const fn from_static(markup: &'static str) -> Self {
        Self(Bytes::from_static(markup.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Markup as text. Fragments are only ever built from `str`, so this never
    /// loses content.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Join fragments into a single contiguous fragment.
    pub fn concat<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a Fragment>,
    {
        let mut buffer = BytesMut::new();
        for part in parts {
            buffer.extend_from_slice(part.as_bytes());
        }
        Self(buffer.freeze())
    }
}

impl From<String> for Fragment {
    fn from(markup: String) -> Self {
        Self(Bytes::from(markup))
    }
}

impl From<&'static str> for Fragment {
    fn from(markup: &'static str) -> Self {
        Self::from_static(markup)
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fragment").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer invocation yields.
pub enum Render {
    /// Finished markup; the node is a leaf.
    Done(Fragment),
    /// Static markup interleaved with child producers discovered during this call.
    Expanded(Template),
    /// The node suspends until the future settles with one of the other variants.
    Awaiting(BoxFuture<'static, Result<Render, ProducerError>>),
}

impl Render {
    pub fn done(fragment: impl Into<Fragment>) -> Self {
        Render::Done(fragment.into())
    }

    pub fn awaiting<F>(future: F) -> Self
    where
        F: Future<Output = Result<Render, ProducerError>> + Send + 'static,
    {
        Render::Awaiting(Box::pin(future))
    }
}

impl fmt::Debug for Render {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Render::Done(fragment) => f.debug_tuple("Done").field(fragment).finish(),
            Render::Expanded(template) => f.debug_tuple("Expanded").field(template).finish(),
            Render::Awaiting(_) => f.write_str("Awaiting(..)"),
        }
    }
}

impl From<Template> for Render {
    fn from(template: Template) -> Self {
        Render::Expanded(template)
    }
}

impl From<Fragment> for Render {
    fn from(fragment: Fragment) -> Self {
        Render::Done(fragment)
    }
}

pub(crate) enum Part {
    Html(Fragment),
    Child(Box<dyn Producer>),
    Boundary {
        producer: Box<dyn Producer>,
        fallback: Fragment,
    },
}

/// Ordered output of an expanding producer.
#[derive(Default)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    /// Append static markup. Empty fragments are skipped.
    pub fn html(mut self, fragment: impl Into<Fragment>) -> Self {
        self.push_html(fragment);
        self
    }

    /// Append a child whose output lands at this position.
    pub fn child(mut self, producer: impl Producer) -> Self {
        self.push_child(producer);
        self
    }

    /// Append one child per item, in iteration order.
    pub fn children<I, P>(mut self, producers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Producer,
    {
        for producer in producers {
            self.push_child(producer);
        }
        self
    }

    /// Append a child whose failures stay inside its subtree: the subtree's
    /// unflushed output is replaced by `fallback` and the render carries on.
    pub fn boundary(mut self, producer: impl Producer, fallback: impl Into<Fragment>) -> Self {
        self.parts.push(Part::Boundary {
            producer: Box::new(producer),
            fallback: fallback.into(),
        });
        self
    }

    pub fn push_html(&mut self, fragment: impl Into<Fragment>) {
        let fragment = fragment.into();
        if !fragment.is_empty() {
            self.parts.push(Part::Html(fragment));
        }
    }

    pub fn push_child(&mut self, producer: impl Producer) {
        self.parts.push(Part::Child(Box::new(producer)));
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub(crate) fn into_parts(self) -> Vec<Part> {
        self.parts
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for part in &self.parts {
            match part {
                Part::Html(fragment) => list.entry(fragment),
                Part::Child(producer) => list.entry(&format_args!("<{}>", producer.name())),
                Part::Boundary { producer, .. } => {
                    list.entry(&format_args!("<boundary {}>", producer.name()))
                }
            };
        }
        list.finish()
    }
}

/// Per-invocation view handed to a producer.
pub struct RenderContext<'a> {
    request_id: Uuid,
    depth: usize,
    pool: &'a NodePool,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(request_id: Uuid, depth: usize, pool: &'a NodePool) -> Self {
        Self {
            request_id,
            depth,
            pool,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Nesting depth; the root is at depth zero.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Shared fragment for repeated markup (see [`NodePool::intern`]).
    pub fn intern(&self, markup: &str) -> Fragment {
        self.pool.intern(markup)
    }

    pub fn pool(&self) -> &NodePool {
        self.pool
    }
}

/// A unit of renderable work supplied by the templating layer.
pub trait Producer: Send + Sync + 'static {
    /// Display name used in logs and failure reports.
    fn name(&self) -> &str {
        ANONYMOUS
    }

    fn render(&self, cx: &RenderContext<'_>) -> Result<Render, ProducerError>;
}

impl Producer for Fragment {
    fn name(&self) -> &str {
        "Fragment"
    }

    fn render(&self, _cx: &RenderContext<'_>) -> Result<Render, ProducerError> {
        Ok(Render::Done(self.clone()))
    }
}

/// A closure-backed producer carrying a display name.
pub struct Component<F> {
    name: String,
    render: F,
}

/// Name a closure producer, e.g. `component("Card", |cx| ...)`.
pub fn component<F>(name: impl Into<String>, render: F) -> Component<F>
where
    F: Fn(&RenderContext<'_>) -> Result<Render, ProducerError> + Send + Sync + 'static,
{
    Component {
        name: name.into(),
        render,
    }
}

impl<F> Producer for Component<F>
where
    F: Fn(&RenderContext<'_>) -> Result<Render, ProducerError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, cx: &RenderContext<'_>) -> Result<Render, ProducerError> {
        (self.render)(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_skips_empty_markup() {
        let template = Template::new()
            .html("")
            .html("<ul>")
            .children(["<li>a</li>", "<li>b</li>"].map(Fragment::from_static))
            .html(String::new())
            .html("</ul>");

        assert_eq!(template.len(), 4);
        assert_eq!(
            format!("{template:?}"),
            r#"[Fragment("<ul>"), <Fragment>, <Fragment>, Fragment("</ul>")]"#
        );
    }

    #[test]
    fn fragments_concatenate_in_order() {
        let parts = [
            Fragment::from_static("<p>"),
            Fragment::from(String::from("hi")),
            Fragment::from_static("</p>"),
        ];
        let joined = Fragment::concat(&parts);
        assert_eq!(joined.as_str(), "<p>hi</p>");
        assert_eq!(joined.len(), 9);
    }

    #[test]
    fn named_component_reports_its_name() {
        let card = component("Card", |_cx| Ok(Render::done("<div></div>")));
        assert_eq!(card.name(), "Card");

        struct Bare;
        impl Producer for Bare {
            fn render(&self, _cx: &RenderContext<'_>) -> Result<Render, ProducerError> {
                Ok(Render::done("x"))
            }
        }
        assert_eq!(Bare.name(), "Anonymous");
    }
}
