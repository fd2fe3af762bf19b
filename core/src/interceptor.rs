//! Interceptor visitor chains.
//!
//! Every handler presented to the dispatch indices is wrapped in a linear
//! pipeline of capability-preserving interceptors. Each wrapper exposes
//! exactly the capabilities of what it wraps, so capability-based
//! registration sees the union of the underlying chain.
//!
//! The default chain carries a single [`ExceptionInterceptor`] that
//! annotates visitor failures with the failing selector and resource
//! identity.

use std::sync::Arc;

use crate::error::FilterError;
use crate::filter::ExecutionContext;
use crate::resource::ResourceConfig;
use crate::selector::PathElement;
use crate::visitor::{
    AfterVisitor, BeforeVisitor, ChildrenVisitor, ContentHandlerBinding, Visitor,
};

type InterceptorCtor =
    Box<dyn Fn(Arc<dyn Visitor>, &ResourceConfig) -> Arc<dyn Visitor> + Send + Sync>;

/// Produces the interceptor chain around a user handler.
///
/// Interceptors are applied in registration order, the last registered
/// becoming the outermost wrapper.
pub struct InterceptorChainFactory {
    interceptors: Vec<InterceptorCtor>,
}

impl Default for InterceptorChainFactory {
    fn default() -> Self {
        let mut factory = Self {
            interceptors: Vec::new(),
        };
        factory.register(|target, config| {
            Arc::new(ExceptionInterceptor::new(target, config)) as Arc<dyn Visitor>
        });
        factory
    }
}

impl InterceptorChainFactory {
    /// A factory producing only the default exception-annotating chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional interceptor constructor.
    pub fn register<F>(&mut self, ctor: F)
    where
        F: Fn(Arc<dyn Visitor>, &ResourceConfig) -> Arc<dyn Visitor> + Send + Sync + 'static,
    {
        self.interceptors.push(Box::new(ctor));
    }

    /// Wrap a binding's handler with the full chain.
    ///
    /// The returned binding shares the resource config of the input.
    #[must_use]
    pub fn create_chain(&self, binding: &ContentHandlerBinding) -> ContentHandlerBinding {
        let config = binding.resource_config();
        let mut handler = Arc::clone(binding.handler());
        for ctor in &self.interceptors {
            handler = ctor(handler, config);
        }
        ContentHandlerBinding::new(Arc::clone(config), handler)
    }
}

impl std::fmt::Debug for InterceptorChainFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChainFactory")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// Wraps visitor failures with the selector and resource identity of the
/// binding the visitor fired under.
#[derive(Debug)]
pub struct ExceptionInterceptor {
    target: Arc<dyn Visitor>,
    selector: String,
    resource: String,
}

impl ExceptionInterceptor {
    /// Wrap a target handler.
    #[must_use]
    pub fn new(target: Arc<dyn Visitor>, config: &ResourceConfig) -> Self {
        Self {
            target,
            selector: config.selector_path().selector().to_string(),
            resource: config.resource().unwrap_or("<inline>").to_string(),
        }
    }

    fn annotate(&self, error: FilterError) -> FilterError {
        match error {
            // Already annotated deeper in the chain.
            annotated @ FilterError::Visitor { .. } => annotated,
            other => FilterError::Visitor {
                selector: self.selector.clone(),
                resource: self.resource.clone(),
                source: Box::new(other),
            },
        }
    }
}

impl Visitor for ExceptionInterceptor {
    fn as_before(&self) -> Option<&dyn BeforeVisitor> {
        self.target.as_before().map(|_| self as &dyn BeforeVisitor)
    }

    fn as_children(&self) -> Option<&dyn ChildrenVisitor> {
        self.target
            .as_children()
            .map(|_| self as &dyn ChildrenVisitor)
    }

    fn as_after(&self) -> Option<&dyn AfterVisitor> {
        self.target.as_after().map(|_| self as &dyn AfterVisitor)
    }
}

impl BeforeVisitor for ExceptionInterceptor {
    fn visit_before(
        &self,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        match self.target.as_before() {
            Some(visitor) => visitor
                .visit_before(element, ctx)
                .map_err(|e| self.annotate(e)),
            None => Ok(()),
        }
    }

    fn before_enabled(&self) -> bool {
        self.target.as_before().map_or(true, |v| v.before_enabled())
    }
}

impl ChildrenVisitor for ExceptionInterceptor {
    fn visit_child_text(
        &self,
        text: &str,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        match self.target.as_children() {
            Some(visitor) => visitor
                .visit_child_text(text, element, ctx)
                .map_err(|e| self.annotate(e)),
            None => Ok(()),
        }
    }

    fn visit_child_element(
        &self,
        child: &PathElement,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        match self.target.as_children() {
            Some(visitor) => visitor
                .visit_child_element(child, element, ctx)
                .map_err(|e| self.annotate(e)),
            None => Ok(()),
        }
    }
}

impl AfterVisitor for ExceptionInterceptor {
    fn visit_after(
        &self,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        match self.target.as_after() {
            Some(visitor) => visitor
                .visit_after(element, ctx)
                .map_err(|e| self.annotate(e)),
            None => Ok(()),
        }
    }

    fn after_enabled(&self) -> bool {
        self.target.as_after().map_or(true, |v| v.after_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::expression::ExpressionEvaluatorFactory;

    #[derive(Debug)]
    struct FailingBefore;

    impl Visitor for FailingBefore {
        fn as_before(&self) -> Option<&dyn BeforeVisitor> {
            Some(self)
        }
    }

    impl BeforeVisitor for FailingBefore {
        fn visit_before(
            &self,
            _element: &PathElement,
            _ctx: &mut ExecutionContext,
        ) -> Result<(), FilterError> {
            Err(FilterError::custom("boom"))
        }
    }

    fn binding(selector: &str, resource: &str, handler: Arc<dyn Visitor>) -> ContentHandlerBinding {
        let mut config = ResourceConfig::new(
            selector,
            &BTreeMap::new(),
            &ExpressionEvaluatorFactory::new(),
        )
        .unwrap();
        config.set_resource(resource);
        ContentHandlerBinding::new(Arc::new(config), handler)
    }

    #[test]
    fn chain_preserves_capability_set() {
        let factory = InterceptorChainFactory::new();
        let wrapped = factory.create_chain(&binding("order", "r", Arc::new(FailingBefore)));

        assert!(wrapped.handler().as_before().is_some());
        assert!(wrapped.handler().as_children().is_none());
        assert!(wrapped.handler().as_after().is_none());
    }

    #[test]
    fn failures_are_annotated_with_selector_and_resource() {
        let factory = InterceptorChainFactory::new();
        let wrapped = factory.create_chain(&binding(
            "order/item",
            "com.acme.ItemVisitor",
            Arc::new(FailingBefore),
        ));

        let element = PathElement::named("item");
        let mut ctx = ExecutionContext::new();
        let err = wrapped
            .handler()
            .as_before()
            .unwrap()
            .visit_before(&element, &mut ctx)
            .unwrap_err();

        match err {
            FilterError::Visitor {
                selector, resource, ..
            } => {
                assert_eq!(selector, "order/item");
                assert_eq!(resource, "com.acme.ItemVisitor");
            }
            other => panic!("expected Visitor, got {other:?}"),
        }
    }
}
