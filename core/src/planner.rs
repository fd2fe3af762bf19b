//! Dispatch planning: visitor bindings in, indexed delivery config out.
//!
//! The planner builds the three dispatch indices (`before`, `child`,
//! `after`) keyed by the local name of each selector path's final element
//! step. Paths that do not end in an element land in the distinct `"*"`
//! bucket. Insertion order within a key is preserved: two handlers on the
//! same key fire in the order their bindings were presented.
//!
//! Position predicates are wired here: for every `[n]` predicate the
//! planner synthesizes an element position counter bound to the path
//! prefix up to the predicated step, injects its slot id into the
//! predicate, and registers the counter itself as a Before visitor at the
//! head of the prefix's dispatch bucket so counters fire first.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ConfigError, FilterError};
use crate::filter::ExecutionContext;
use crate::interceptor::InterceptorChainFactory;
use crate::resource::ResourceConfig;
use crate::selector::{PathElement, Predicate, SelectorPath, SelectorStep, WILDCARD_SELECTOR};
use crate::visitor::{BeforeVisitor, ContentHandlerBinding, Visitor};

/// An ordered dispatch index: `local name -> bindings`, plus the distinct
/// `"*"` bucket for non-indexed selector paths.
#[derive(Debug, Default)]
pub struct VisitorIndex {
    table: HashMap<String, Vec<ContentHandlerBinding>>,
}

impl VisitorIndex {
    fn new() -> Self {
        Self::default()
    }

    fn put(&mut self, key: &str, binding: ContentHandlerBinding) {
        self.table.entry(key.to_string()).or_default().push(binding);
    }

    /// Insert at the head of a bucket. Position counters use this so they
    /// run before the handlers whose predicates read them.
    fn put_first(&mut self, key: &str, binding: ContentHandlerBinding) {
        self.table
            .entry(key.to_string())
            .or_default()
            .insert(0, binding);
    }

    /// The bucket for a dispatch key; empty when nothing is registered.
    #[must_use]
    pub fn get(&self, key: &str) -> &[ContentHandlerBinding] {
        self.table.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All dispatch keys, unsorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    /// Total number of registered bindings across all keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.values().map(Vec::len).sum()
    }

    /// Whether the index has no bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A record of one planning decision, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct PlanEvent {
    /// Selector of the planned resource.
    pub selector: String,
    /// Resource identity of the planned resource.
    pub resource: String,
    /// What was done.
    pub detail: String,
}

impl fmt::Display for PlanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.selector, self.detail, self.resource)
    }
}

/// Immutable dispatch configuration for one `(profile, bindings)` build.
#[derive(Debug, Default)]
pub struct ContentDeliveryConfig {
    before: VisitorIndex,
    child: VisitorIndex,
    after: VisitorIndex,
    events: Vec<PlanEvent>,
    position_counter_count: usize,
}

impl ContentDeliveryConfig {
    /// The Before dispatch index.
    #[must_use]
    pub fn before(&self) -> &VisitorIndex {
        &self.before
    }

    /// The Child dispatch index.
    #[must_use]
    pub fn child(&self) -> &VisitorIndex {
        &self.child
    }

    /// The After dispatch index.
    #[must_use]
    pub fn after(&self) -> &VisitorIndex {
        &self.after
    }

    /// What the planner did, in order.
    #[must_use]
    pub fn events(&self) -> &[PlanEvent] {
        &self.events
    }

    /// Number of position counter slots an execution context must carry.
    #[must_use]
    pub fn position_counter_count(&self) -> usize {
        self.position_counter_count
    }
}

/// A dispatch planner for one filtering strategy.
pub trait FilterProvider: Send + Sync + fmt::Debug {
    /// Strategy name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this planner can serve every one of the given bindings.
    fn is_provider(&self, bindings: &[ContentHandlerBinding]) -> bool;

    /// Build the delivery config for the bindings.
    fn create_content_delivery_config(
        &self,
        bindings: &[ContentHandlerBinding],
        namespaces: &BTreeMap<String, String>,
        interceptors: &InterceptorChainFactory,
    ) -> Result<ContentDeliveryConfig, ConfigError>;
}

/// The streaming-strategy planner.
///
/// Serves handlers that are Before- or After-capable; a handler that is
/// neither (a pure DOM processor) belongs to a different strategy and is
/// skipped.
#[derive(Debug, Default)]
pub struct StreamFilterProvider;

impl FilterProvider for StreamFilterProvider {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn is_provider(&self, bindings: &[ContentHandlerBinding]) -> bool {
        bindings.iter().all(|b| {
            let handler = b.handler();
            handler.as_before().is_some() || handler.as_after().is_some()
        })
    }

    fn create_content_delivery_config(
        &self,
        bindings: &[ContentHandlerBinding],
        namespaces: &BTreeMap<String, String>,
        interceptors: &InterceptorChainFactory,
    ) -> Result<ContentDeliveryConfig, ConfigError> {
        let mut delivery = ContentDeliveryConfig::default();

        for binding in bindings {
            let handler = binding.handler();
            if handler.as_before().is_none() && handler.as_after().is_none() {
                // Not a streaming visitor; another strategy's planner owns it.
                continue;
            }

            let mut config = ResourceConfig::clone(binding.resource_config());
            config.selector_path_mut().set_namespaces(namespaces);

            if handler.as_before().is_some() || handler.as_children().is_some() {
                assert_selector_not_accessing_text(&config)?;
            }

            let counters = bind_position_counters(
                &mut config,
                &mut delivery.position_counter_count,
            );

            let config = Arc::new(config);
            let rebased = ContentHandlerBinding::new(Arc::clone(&config), Arc::clone(handler));
            let wrapped = interceptors.create_chain(&rebased);
            let key = config
                .selector_path()
                .dispatch_key()
                .unwrap_or(WILDCARD_SELECTOR)
                .to_string();

            let chain = wrapped.handler();
            let before_ok = handler.as_before().map_or(false, |v| v.before_enabled());
            let after_ok = handler.as_after().map_or(false, |v| v.after_enabled());

            if chain.as_before().is_some() && before_ok {
                delivery.before.put(&key, wrapped.clone());
                if chain.as_children().is_some() {
                    delivery.child.put(&key, wrapped.clone());
                }
            }
            if chain.as_after().is_some() && after_ok {
                delivery.after.put(&key, wrapped.clone());
                // A handler that is both Before and After already went into
                // the child index above.
                if chain.as_before().is_none() && chain.as_children().is_some() {
                    delivery.child.put(&key, wrapped.clone());
                }
            }

            for (counter_key, counter_binding) in counters {
                delivery.events.push(PlanEvent {
                    selector: counter_binding.resource_config().selector_path().selector().to_string(),
                    resource: "element-position-counter".to_string(),
                    detail: format!("position counter registered under '{counter_key}'"),
                });
                delivery.before.put_first(&counter_key, counter_binding);
            }

            delivery.events.push(PlanEvent {
                selector: config.selector_path().selector().to_string(),
                resource: config.resource().unwrap_or("<inline>").to_string(),
                detail: "added as a stream visitor".to_string(),
            });
        }

        Ok(delivery)
    }
}

fn assert_selector_not_accessing_text(config: &ResourceConfig) -> Result<(), ConfigError> {
    if let Some(target) = config.selector_path().target_element() {
        if target.accesses_text() {
            return Err(ConfigError::InvalidSelector {
                selector: config.selector_path().selector().to_string(),
                reason: format!(
                    "the text() token is only supported on visitors implementing the After \
                     capability only; resource '{}' implements Before or Children",
                    config.resource().unwrap_or("<inline>")
                ),
            });
        }
    }
    Ok(())
}

/// Allocate a counter slot for every position predicate on the path,
/// inject it, and return the counter bindings to register.
///
/// The counter's own selector is the path prefix up to the predicated
/// step, carrying the predicates written *before* the positional one, so
/// the counter counts only elements matching those earlier predicates.
fn bind_position_counters(
    config: &mut ResourceConfig,
    next_counter: &mut usize,
) -> Vec<(String, ContentHandlerBinding)> {
    let namespaces = config.selector_path().namespaces().clone();
    let mut counters = Vec::new();

    let step_count = config.selector_path().steps().len();
    for step_idx in 0..step_count {
        let predicate_count = match &config.selector_path().steps()[step_idx] {
            SelectorStep::Element(element) => element.predicates.len(),
            _ => continue,
        };

        for predicate_idx in 0..predicate_count {
            let is_position = matches!(
                step_predicate(config.selector_path(), step_idx, predicate_idx),
                Predicate::Position { .. }
            );
            if !is_position {
                continue;
            }

            // Prefix before injection: earlier predicates (already bound
            // counters included) stay, the positional one and everything
            // after it are dropped.
            let mut prefix: Vec<SelectorStep> =
                config.selector_path().steps()[..=step_idx].to_vec();
            if let Some(SelectorStep::Element(element)) = prefix.last_mut() {
                element.predicates.truncate(predicate_idx);
            }

            let id = *next_counter;
            *next_counter += 1;

            if let SelectorStep::Element(element) =
                &mut config.selector_path_mut().steps_mut()[step_idx]
            {
                if let Predicate::Position { counter, .. } = &mut element.predicates[predicate_idx]
                {
                    *counter = Some(id);
                }
            }

            let prefix_path = SelectorPath::from_steps(prefix, namespaces.clone());
            let Some(key) = prefix_path.dispatch_key().map(str::to_string) else {
                continue;
            };
            let counter_config = Arc::new(ResourceConfig::from_selector_path(prefix_path));
            counters.push((
                key,
                ContentHandlerBinding::new(counter_config, Arc::new(ElementPositionCounter::new(id))),
            ));
        }
    }

    counters
}

fn step_predicate(path: &SelectorPath, step_idx: usize, predicate_idx: usize) -> &Predicate {
    match &path.steps()[step_idx] {
        SelectorStep::Element(element) => &element.predicates[predicate_idx],
        _ => unreachable!("caller checked the step is an element"),
    }
}

/// A synthetic Before visitor that tracks the index of children matching a
/// selector prefix, so positional predicates can be evaluated.
///
/// The count lives in the execution context, scoped to the parent element
/// of the matched one; it increments on every matching start.
#[derive(Debug)]
pub struct ElementPositionCounter {
    id: usize,
}

impl ElementPositionCounter {
    fn new(id: usize) -> Self {
        Self { id }
    }

    /// The counter slot in the execution context.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Visitor for ElementPositionCounter {
    fn as_before(&self) -> Option<&dyn BeforeVisitor> {
        Some(self)
    }
}

impl BeforeVisitor for ElementPositionCounter {
    fn visit_before(
        &self,
        _element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        ctx.increment_position(self.id);
        Ok(())
    }
}
