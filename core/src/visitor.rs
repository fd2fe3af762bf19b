//! Visitor capabilities, content-handler bindings and the visitor
//! registry.
//!
//! Handlers are polymorphic over the capability set `{Before, Children,
//! After}`. Each capability is its own trait; the umbrella [`Visitor`]
//! trait exposes capability accessors so the planner can ask "is this
//! handler Before-capable?" the way the registration rules require. A
//! wrapper (an interceptor) forwards the accessors of whatever it wraps,
//! so capability-based registration sees the union of the chain.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{ConfigError, FilterError};
use crate::filter::ExecutionContext;
use crate::resource::ResourceConfig;
use crate::selector::PathElement;

/// Fires on element start, after the selector matched the running path.
pub trait BeforeVisitor: Send + Sync + Debug {
    /// Called once per matched element start.
    fn visit_before(
        &self,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError>;

    /// Whether this visitor's Before capability is currently enabled.
    ///
    /// Checked at plan time against the original (unwrapped) handler.
    fn before_enabled(&self) -> bool {
        true
    }
}

/// Fires on each direct child event of a matched element.
pub trait ChildrenVisitor: Send + Sync + Debug {
    /// Called for character data appearing directly under the matched
    /// element.
    fn visit_child_text(
        &self,
        text: &str,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError>;

    /// Called when a direct child element of the matched element starts.
    fn visit_child_element(
        &self,
        child: &PathElement,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError>;
}

/// Fires on element end; the selector is re-evaluated at end, so After
/// fires even when Before did not.
pub trait AfterVisitor: Send + Sync + Debug {
    /// Called once per matched element end.
    fn visit_after(
        &self,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError>;

    /// Whether this visitor's After capability is currently enabled.
    fn after_enabled(&self) -> bool {
        true
    }
}

/// Umbrella trait: a handler exposing one or more visit capabilities.
///
/// Implementations override the accessors for the capabilities they carry;
/// the default is none. The planner and engine never downcast, they only
/// ask for capabilities.
pub trait Visitor: Send + Sync + Debug {
    /// The Before capability, if this handler has one.
    fn as_before(&self) -> Option<&dyn BeforeVisitor> {
        None
    }

    /// The Children capability, if this handler has one.
    fn as_children(&self) -> Option<&dyn ChildrenVisitor> {
        None
    }

    /// The After capability, if this handler has one.
    fn as_after(&self) -> Option<&dyn AfterVisitor> {
        None
    }
}

/// A resource config paired with the handler it configures.
#[derive(Debug, Clone)]
pub struct ContentHandlerBinding {
    resource_config: Arc<ResourceConfig>,
    handler: Arc<dyn Visitor>,
}

impl ContentHandlerBinding {
    /// Pair a resource config with a handler.
    #[must_use]
    pub fn new(resource_config: Arc<ResourceConfig>, handler: Arc<dyn Visitor>) -> Self {
        Self {
            resource_config,
            handler,
        }
    }

    /// The resource config.
    #[must_use]
    pub fn resource_config(&self) -> &Arc<ResourceConfig> {
        &self.resource_config
    }

    /// The handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn Visitor> {
        &self.handler
    }
}

type VisitorFactory =
    Box<dyn Fn(&ResourceConfig) -> Result<Arc<dyn Visitor>, ConfigError> + Send + Sync>;

/// Builder for a [`VisitorRegistry`].
///
/// The registry is immutable after `build()`; register everything up
/// front. The built-in extension visitors are pre-registered so extension
/// configurations resolve out of the box.
pub struct VisitorRegistryBuilder {
    factories: std::collections::HashMap<String, VisitorFactory>,
}

impl VisitorRegistryBuilder {
    fn new() -> Self {
        let mut builder = Self {
            factories: std::collections::HashMap::new(),
        };
        crate::digester::register_extension_visitors(&mut builder);
        builder
    }

    /// Register a visitor factory under a resource name.
    ///
    /// The factory receives the resource config the visitor is being
    /// created for, so it can read its parameters.
    #[must_use]
    pub fn visitor<F>(mut self, resource: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ResourceConfig) -> Result<Arc<dyn Visitor>, ConfigError> + Send + Sync + 'static,
    {
        self.insert(resource, factory);
        self
    }

    pub(crate) fn insert<F>(&mut self, resource: impl Into<String>, factory: F)
    where
        F: Fn(&ResourceConfig) -> Result<Arc<dyn Visitor>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(resource.into(), Box::new(factory));
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> VisitorRegistry {
        VisitorRegistry {
            factories: self.factories,
        }
    }
}

/// Name-keyed lookup from resource locator strings to visitor factories.
///
/// This is the bean-factory lookup contract: the digester stores resource
/// locator strings; turning them into live handlers goes through here.
pub struct VisitorRegistry {
    factories: std::collections::HashMap<String, VisitorFactory>,
}

impl VisitorRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> VisitorRegistryBuilder {
        VisitorRegistryBuilder::new()
    }

    /// Whether a factory is registered for the resource name.
    #[must_use]
    pub fn contains(&self, resource: &str) -> bool {
        self.factories.contains_key(resource)
    }

    /// Create a binding for a resource config whose resource names a
    /// registered visitor.
    ///
    /// Returns `Ok(None)` when the config has no resource or the resource
    /// names nothing registered (such configs are data, not visitors).
    pub fn create_binding(
        &self,
        config: &Arc<ResourceConfig>,
    ) -> Result<Option<ContentHandlerBinding>, ConfigError> {
        let Some(resource) = config.resource() else {
            return Ok(None);
        };
        let Some(factory) = self.factories.get(resource) else {
            return Ok(None);
        };
        let handler = factory(config)?;
        Ok(Some(ContentHandlerBinding::new(
            Arc::clone(config),
            handler,
        )))
    }

    /// Create a binding, failing when the resource is unknown.
    ///
    /// Used for extension configurations, where every resource must name a
    /// registered extension visitor.
    pub fn require_binding(
        &self,
        config: &Arc<ResourceConfig>,
    ) -> Result<ContentHandlerBinding, ConfigError> {
        let resource = config.resource().unwrap_or("");
        let factory =
            self.factories
                .get(resource)
                .ok_or_else(|| ConfigError::UnknownVisitor {
                    resource: resource.to_string(),
                })?;
        let handler = factory(config)?;
        Ok(ContentHandlerBinding::new(Arc::clone(config), handler))
    }

    /// Registered resource names, unsorted.
    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl Debug for VisitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorRegistry")
            .field("resources", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::expression::ExpressionEvaluatorFactory;

    #[derive(Debug)]
    struct NoopBefore;

    impl Visitor for NoopBefore {
        fn as_before(&self) -> Option<&dyn BeforeVisitor> {
            Some(self)
        }
    }

    impl BeforeVisitor for NoopBefore {
        fn visit_before(
            &self,
            _element: &PathElement,
            _ctx: &mut ExecutionContext,
        ) -> Result<(), FilterError> {
            Ok(())
        }
    }

    fn config(selector: &str, resource: Option<&str>) -> Arc<ResourceConfig> {
        let mut config = ResourceConfig::new(
            selector,
            &BTreeMap::new(),
            &ExpressionEvaluatorFactory::new(),
        )
        .unwrap();
        if let Some(resource) = resource {
            config.set_resource(resource);
        }
        Arc::new(config)
    }

    #[test]
    fn capability_accessors_default_to_none() {
        #[derive(Debug)]
        struct NoCapabilities;
        impl Visitor for NoCapabilities {}

        let visitor = NoCapabilities;
        assert!(visitor.as_before().is_none());
        assert!(visitor.as_children().is_none());
        assert!(visitor.as_after().is_none());
    }

    #[test]
    fn registry_resolves_registered_resources() {
        let registry = VisitorRegistry::builder()
            .visitor("com.acme.OrderVisitor", |_| Ok(Arc::new(NoopBefore) as _))
            .build();

        let bound = registry
            .create_binding(&config("order", Some("com.acme.OrderVisitor")))
            .unwrap();
        assert!(bound.is_some());

        let unbound = registry
            .create_binding(&config("order", Some("com.acme.Unknown")))
            .unwrap();
        assert!(unbound.is_none());

        let no_resource = registry.create_binding(&config("order", None)).unwrap();
        assert!(no_resource.is_none());
    }

    #[test]
    fn require_binding_fails_on_unknown_resource() {
        let registry = VisitorRegistry::builder().build();
        let err = registry
            .require_binding(&config("order", Some("com.acme.Unknown")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVisitor { .. }));
    }

    #[test]
    fn extension_visitors_are_preregistered() {
        let registry = VisitorRegistry::builder().build();
        assert!(registry.contains("new-resource-config"));
        assert!(registry.contains("map-to-attribute"));
    }
}
