//! Execution-time dispatch.
//!
//! Drives the streaming event source through the dispatch indices built by
//! the planner. Per element start at path `P` with local name `L`:
//!
//! - fire every matching binding in `before[L]` then `before["*"]`
//!   (position counters were planted at the head of their buckets, so they
//!   fire first);
//! - on each direct child event, fire matching `child[L]` handlers once
//!   per child;
//! - on element end, fire `after[L]` then `after["*"]` in registration
//!   order. After fires even when Before did not: the selector is
//!   re-evaluated at end.
//!
//! Selector matches require the full path to match, predicates evaluated
//! left-to-right with short-circuiting, and the binding's condition (if
//! any) to hold against the context variables.
//!
//! A filter execution may be aborted externally through a
//! [`TerminateHandle`]; visitors observe no further callbacks after
//! cancellation, while the reader parses on to the document boundary.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::FilterError;
use crate::expression::ExpressionContext;
use crate::planner::ContentDeliveryConfig;
use crate::reader::{CdrReader, ReaderSettings, XmlEventHandler};
use crate::selector::{PathElement, PredicateEnv, WILDCARD_SELECTOR};
use crate::visitor::ContentHandlerBinding;

/// Shared cancellation switch for an execution.
#[derive(Debug, Clone, Default)]
pub struct TerminateHandle {
    flag: Arc<AtomicBool>,
}

impl TerminateHandle {
    /// Create an un-terminated handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the execution this handle is attached to.
    pub fn terminate(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether termination was requested.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-execution state: condition variables, typed attributes and position
/// counter frames.
pub struct ExecutionContext {
    vars: ExpressionContext,
    attributes: HashMap<TypeId, Box<dyn Any + Send>>,
    frames: Vec<CounterFrame>,
    terminate: TerminateHandle,
}

#[derive(Debug, Default)]
struct CounterFrame {
    counts: HashMap<usize, usize>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Create a fresh context. The document frame is always present.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vars: ExpressionContext::new(),
            attributes: HashMap::new(),
            frames: vec![CounterFrame::default()],
            terminate: TerminateHandle::new(),
        }
    }

    /// Condition variables, immutable.
    #[must_use]
    pub fn variables(&self) -> &ExpressionContext {
        &self.vars
    }

    /// Set a condition variable.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.set(name, value);
    }

    /// Store a typed attribute, replacing any previous value of the type.
    pub fn put<T: Any + Send>(&mut self, value: T) {
        self.attributes.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Borrow a typed attribute.
    #[must_use]
    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.attributes
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Mutably borrow a typed attribute.
    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.attributes
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut())
    }

    /// Remove and return a typed attribute.
    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        self.attributes
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast().ok())
            .map(|boxed| *boxed)
    }

    /// The cancellation handle for this execution.
    #[must_use]
    pub fn terminate_handle(&self) -> TerminateHandle {
        self.terminate.clone()
    }

    /// Whether this execution was cancelled.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminate.is_terminated()
    }

    /// Increment a position counter in the parent frame of the element
    /// currently being opened. Called by planted counter visitors.
    pub fn increment_position(&mut self, counter: usize) {
        let parent = self.frames.len().saturating_sub(2);
        if let Some(frame) = self.frames.get_mut(parent) {
            *frame.counts.entry(counter).or_insert(0) += 1;
        }
    }

    fn push_frame(&mut self) {
        self.frames.push(CounterFrame::default());
    }

    fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }
}

impl PredicateEnv for ExecutionContext {
    fn position_at(&self, counter: usize, depth: usize) -> usize {
        self.frames
            .get(depth)
            .and_then(|frame| frame.counts.get(&counter))
            .copied()
            .unwrap_or(0)
    }

    fn vars(&self) -> &ExpressionContext {
        &self.vars
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("depth", &(self.frames.len() - 1))
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Drives a source document through a delivery config's indices.
#[derive(Debug)]
pub struct Filter<'a> {
    delivery: &'a ContentDeliveryConfig,
}

impl<'a> Filter<'a> {
    /// Create a filter over the given delivery config.
    #[must_use]
    pub fn new(delivery: &'a ContentDeliveryConfig) -> Self {
        Self { delivery }
    }

    /// Filter a source document with a default-configured reader.
    pub fn filter(&self, source: &str, ctx: &mut ExecutionContext) -> Result<(), FilterError> {
        let mut reader = CdrReader::new(ReaderSettings::default());
        self.filter_with_reader(&mut reader, source, ctx)
    }

    /// Filter a source document through a caller-supplied (pooled) reader.
    pub fn filter_with_reader(
        &self,
        reader: &mut CdrReader,
        source: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        let mut sink = FilterSink {
            delivery: self.delivery,
            ctx,
            path: Vec::new(),
        };
        reader.read(source, &mut sink)
    }
}

/// The event handler that performs the actual dispatch.
struct FilterSink<'a> {
    delivery: &'a ContentDeliveryConfig,
    ctx: &'a mut ExecutionContext,
    path: Vec<PathElement>,
}

impl FilterSink<'_> {
    fn fire_bucket_matches(
        &mut self,
        bindings: &[ContentHandlerBinding],
        fire: FireKind<'_>,
    ) -> Result<(), FilterError> {
        for binding in bindings {
            let selector = binding.resource_config().selector_path();
            if !selector.matches(&self.path, &*self.ctx) {
                continue;
            }
            if let Some(condition) = selector.condition() {
                if !condition.evaluate(self.ctx.variables()) {
                    continue;
                }
            }

            let Some(element) = self.path.last() else {
                return Ok(());
            };
            match fire {
                FireKind::Before => {
                    if let Some(visitor) = binding.handler().as_before() {
                        visitor.visit_before(element, self.ctx)?;
                    }
                }
                FireKind::After => {
                    if let Some(visitor) = binding.handler().as_after() {
                        visitor.visit_after(element, self.ctx)?;
                    }
                }
                FireKind::ChildText(text) => {
                    if let Some(visitor) = binding.handler().as_children() {
                        visitor.visit_child_text(text, element, self.ctx)?;
                    }
                }
                FireKind::ChildElement(child) => {
                    if let Some(visitor) = binding.handler().as_children() {
                        visitor.visit_child_element(child, element, self.ctx)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn fire_indexed(
        &mut self,
        index: IndexKind,
        fire: FireKind<'_>,
    ) -> Result<(), FilterError> {
        if self.ctx.is_terminated() {
            return Ok(());
        }
        let Some(top) = self.path.last() else {
            return Ok(());
        };
        let local = top.local.clone();
        let index = match index {
            IndexKind::Before => self.delivery.before(),
            IndexKind::Child => self.delivery.child(),
            IndexKind::After => self.delivery.after(),
        };
        // The bucket slices borrow the delivery config, not the sink.
        let named: &[ContentHandlerBinding] = index.get(&local);
        let wildcard: &[ContentHandlerBinding] = index.get(WILDCARD_SELECTOR);
        self.fire_bucket_matches(named, fire)?;
        self.fire_bucket_matches(wildcard, fire)?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum IndexKind {
    Before,
    Child,
    After,
}

#[derive(Clone, Copy)]
enum FireKind<'f> {
    Before,
    After,
    ChildText(&'f str),
    ChildElement(&'f PathElement),
}

impl XmlEventHandler for FilterSink<'_> {
    fn start_element(&mut self, element: PathElement) -> Result<(), FilterError> {
        // The new element is a direct child event of the enclosing element.
        if !self.path.is_empty() {
            self.fire_indexed(IndexKind::Child, FireKind::ChildElement(&element))?;
        }

        self.path.push(element);
        self.ctx.push_frame();
        self.fire_indexed(IndexKind::Before, FireKind::Before)
    }

    fn characters(&mut self, text: &str) -> Result<(), FilterError> {
        self.fire_indexed(IndexKind::Child, FireKind::ChildText(text))
    }

    fn end_element(&mut self, _local: &str) -> Result<(), FilterError> {
        self.fire_indexed(IndexKind::After, FireKind::After)?;
        self.path.pop();
        self.ctx.pop_frame();
        Ok(())
    }
}
