//! cedra - a streaming content-transformation engine driven by declarative
//! `.cdrl` pipeline descriptions.
//!
//! The engine digests an XML pipeline description into an indexed table of
//! selector-bound visitors, then drives a streaming event source through
//! those visitors so each matching element fires its Before/Child/After
//! callbacks in document order.
//!
//! # Architecture
//!
//! - [`SelectorPath`] - compiled XPath-subset locator with predicates
//! - [`ResourceConfig`] / [`ResourceConfigSeq`] - the digested
//!   configuration model
//! - [`digest_config`] - recursive configuration digestion: imports,
//!   `@NAME@` substitution, profiles, conditions, extension namespaces
//! - [`StreamFilterProvider`] - plans bindings into a
//!   [`ContentDeliveryConfig`] (the `before`/`child`/`after` indices)
//! - [`ContentDeliveryRuntimeFactory`] - caches per-profile builders and
//!   reader pools, hands out execution runtimes
//! - [`Filter`] / [`ExecutionContext`] - execution-time dispatch
//!
//! # Key invariants
//!
//! 1. **Dispatch keying**: an indexed selector path registers under the
//!    local name of its final element step; everything else goes to the
//!    distinct `"*"` bucket.
//! 2. **Ordering**: within one document, Before/Child firings follow
//!    document order and After firings reverse-document-order close;
//!    within one dispatch key, registration order is firing order.
//! 3. **No partial sequences**: configuration errors are fatal to the
//!    digestion task, annotated with the config path that raised them.
//!
//! # Example
//!
//! ```
//! use cedra::prelude::*;
//!
//! let config = r#"<cedra-resource-list xmlns="https://www.cedra.io/xsd/cedra-2.0.xsd">
//!   <resource-config selector="order/item">
//!     <param name="unit">widget</param>
//!   </resource-config>
//! </cedra-resource-list>"#;
//!
//! let locator = InMemoryResourceLocator::new();
//! let visitors = VisitorRegistry::builder().build();
//! let mut extensions = ExtensionDigesters::new();
//! let seq = digest_config(config, "root", &locator, &visitors, &mut extensions)?;
//!
//! assert_eq!(seq.len(), 1);
//! let item = seq.resource_configs().next().unwrap();
//! assert_eq!(item.selector_path().dispatch_key(), Some("item"));
//! assert_eq!(item.params().first("unit").unwrap().value, "widget");
//! # Ok::<(), cedra::ConfigError>(())
//! ```

// ═══════════════════════════════════════════════════════════════════════════════
// Modules
// ═══════════════════════════════════════════════════════════════════════════════

mod digester;
mod error;
mod expression;
mod filter;
mod interceptor;
mod param;
mod planner;
mod profile;
mod reader;
mod resource;
mod selector;
mod seq;
mod visitor;

pub mod uri;

mod runtime;

// ═══════════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════════

pub use digester::{
    digest_config, DigestMode, ExtensionContext, ExtensionDigester, ExtensionDigesters,
    FileResourceLocator, InMemoryResourceLocator, PendingResourceConfig, ResourceLocator,
    XmlConfigDigester, ROOT_ELEMENT,
};
pub use error::{ConfigError, FilterError};
pub use expression::{
    BasicExpressionEvaluator, ExpressionContext, ExpressionEvaluator, ExpressionEvaluatorFactory,
    DEFAULT_EVALUATOR,
};
pub use filter::{ExecutionContext, Filter, TerminateHandle};
pub use interceptor::{ExceptionInterceptor, InterceptorChainFactory};
pub use param::{ParamType, ParamValue, Parameter, ParameterMap};
pub use planner::{
    ContentDeliveryConfig, ElementPositionCounter, FilterProvider, PlanEvent,
    StreamFilterProvider, VisitorIndex,
};
pub use profile::{ProfileSet, ProfileStore};
pub use reader::{
    CdrReader, ReaderPool, ReaderSettings, XmlEventHandler, FEATURE_CHECK_END_NAMES,
    FEATURE_TRIM_TEXT,
};
pub use resource::{
    DefaultResourceConfigFactory, ResourceConfig, ResourceConfigFactory,
    ResourceConfigFactoryRegistry, GLOBAL_PARAMETERS, READER_SELECTOR, SELECTOR_NONE,
};
pub use runtime::{
    ContentDeliveryConfigBuilder, ContentDeliveryRuntime, ContentDeliveryRuntimeFactory,
    PARAM_READER_POOL_SIZE, PARAM_READER_POOL_TIMEOUT_MS,
};
pub use selector::{
    ElementStep, PathElement, Predicate, PredicateEnv, QName, SelectorPath, SelectorStep,
    WILDCARD_SELECTOR,
};
pub use seq::{ResourceConfigSeq, SeqEntry};
pub use visitor::{
    AfterVisitor, BeforeVisitor, ChildrenVisitor, ContentHandlerBinding, Visitor, VisitorRegistry,
    VisitorRegistryBuilder,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Prelude
// ═══════════════════════════════════════════════════════════════════════════════

/// Prelude module for convenient imports.
///
/// ```
/// use cedra::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        digest_config,
        // Visitor capabilities
        AfterVisitor,
        BeforeVisitor,
        ChildrenVisitor,
        // Errors
        ConfigError,
        // Planning and execution
        ContentDeliveryConfig,
        ContentDeliveryRuntime,
        ContentDeliveryRuntimeFactory,
        ContentHandlerBinding,
        ExecutionContext,
        ExpressionContext,
        ExpressionEvaluator,
        ExpressionEvaluatorFactory,
        ExtensionDigesters,
        Filter,
        FilterError,
        InMemoryResourceLocator,
        ParameterMap,
        PathElement,
        ProfileSet,
        // Configuration model
        ResourceConfig,
        ResourceConfigSeq,
        ResourceLocator,
        SelectorPath,
        StreamFilterProvider,
        Visitor,
        VisitorRegistry,
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// The supported configuration namespace.
///
/// A `.cdrl` document whose root element is in any other default namespace
/// is rejected with [`ConfigError::UnsupportedNamespace`].
pub const NS_CDRL_20: &str = "https://www.cedra.io/xsd/cedra-2.0.xsd";
