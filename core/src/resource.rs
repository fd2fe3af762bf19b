//! The resource-config model: one `(selector-path, resource, parameters,
//! profile, condition)` unit, plus the factory seam used by the digester.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::expression::{ExpressionEvaluator, ExpressionEvaluatorFactory};
use crate::param::{ParamType, ParameterMap};
use crate::profile::ProfileSet;
use crate::selector::SelectorPath;

/// Selector of the sentinel resource that carries document-global
/// parameters.
pub const GLOBAL_PARAMETERS: &str = "global-parameters";

/// Selector of the resource that configures the streaming XML reader.
pub const READER_SELECTOR: &str = "xml.reader.driver";

/// Default selector assigned when a `<resource-config>` declares none.
pub const SELECTOR_NONE: &str = "none";

/// A single content-delivery resource unit.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    selector_path: SelectorPath,
    resource: Option<String>,
    params: ParameterMap,
    target_profile: Option<String>,
}

impl ResourceConfig {
    /// Create a resource config by compiling the given selector.
    pub fn new(
        selector: &str,
        namespaces: &BTreeMap<String, String>,
        evaluators: &ExpressionEvaluatorFactory,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            selector_path: SelectorPath::parse(selector, namespaces, evaluators)?,
            resource: None,
            params: ParameterMap::new(),
            target_profile: None,
        })
    }

    /// Create a resource config around an already-compiled selector path.
    #[must_use]
    pub fn from_selector_path(selector_path: SelectorPath) -> Self {
        Self {
            selector_path,
            resource: None,
            params: ParameterMap::new(),
            target_profile: None,
        }
    }

    /// The compiled selector path.
    #[must_use]
    pub fn selector_path(&self) -> &SelectorPath {
        &self.selector_path
    }

    /// Mutable access to the selector path (namespace install, condition
    /// attachment, plan-time counter binding).
    pub fn selector_path_mut(&mut self) -> &mut SelectorPath {
        &mut self.selector_path
    }

    /// The resource locator: a visitor name or URI, if declared.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Set the resource locator.
    pub fn set_resource(&mut self, resource: impl Into<String>) {
        self.resource = Some(resource.into());
    }

    /// The parameter map.
    #[must_use]
    pub fn params(&self) -> &ParameterMap {
        &self.params
    }

    /// Append a string parameter.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.set(name, value);
    }

    /// Append a typed parameter.
    pub fn set_typed_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        param_type: ParamType,
    ) {
        self.params.set_typed(name, value, param_type);
    }

    /// Mutable access to the parameter map.
    pub fn params_mut(&mut self) -> &mut ParameterMap {
        &mut self.params
    }

    /// The target profile expression (comma-separated names), if any.
    #[must_use]
    pub fn target_profile(&self) -> Option<&str> {
        self.target_profile.as_deref()
    }

    /// Set the target profile expression.
    pub fn set_target_profile(&mut self, profile: impl Into<String>) {
        self.target_profile = Some(profile.into());
    }

    /// The condition gating this resource, if any.
    #[must_use]
    pub fn condition(&self) -> Option<&Arc<dyn ExpressionEvaluator>> {
        self.selector_path.condition()
    }

    /// Whether this resource applies to the given profile set.
    ///
    /// A resource with no target profile applies everywhere; otherwise any
    /// comma-separated name that is a member of the set selects it.
    #[must_use]
    pub fn applies_to(&self, profile_set: &ProfileSet) -> bool {
        match &self.target_profile {
            None => true,
            Some(expr) => expr
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .any(|t| profile_set.is_member(t)),
        }
    }
}

impl fmt::Display for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target[{}]", self.selector_path)?;
        if let Some(resource) = &self.resource {
            write!(f, " resource[{resource}]")?;
        }
        if let Some(profile) = &self.target_profile {
            write!(f, " profile[{profile}]")?;
        }
        Ok(())
    }
}

/// Builds a [`ResourceConfig`] from a `<resource-config>` element.
///
/// The digester resolves the `factory` attribute against a
/// [`ResourceConfigFactoryRegistry`] and delegates element interpretation
/// here; conditions and parameters are attached by the digester afterwards.
pub trait ResourceConfigFactory: Send + Sync + fmt::Debug {
    /// Create the base resource config for the element.
    fn create(
        &self,
        default_profile: Option<&str>,
        element: &roxmltree::Node<'_, '_>,
        namespaces: &BTreeMap<String, String>,
        evaluators: &ExpressionEvaluatorFactory,
    ) -> Result<ResourceConfig, ConfigError>;
}

/// The default factory: reads `selector`, `target-profile` and the
/// `<resource>` child element.
#[derive(Debug, Default)]
pub struct DefaultResourceConfigFactory;

impl ResourceConfigFactory for DefaultResourceConfigFactory {
    fn create(
        &self,
        default_profile: Option<&str>,
        element: &roxmltree::Node<'_, '_>,
        namespaces: &BTreeMap<String, String>,
        evaluators: &ExpressionEvaluatorFactory,
    ) -> Result<ResourceConfig, ConfigError> {
        let selector = element.attribute("selector").unwrap_or(SELECTOR_NONE);
        let mut config = ResourceConfig::new(selector, namespaces, evaluators)?;

        match element.attribute("target-profile") {
            Some(profile) => config.set_target_profile(profile),
            None => {
                if let Some(profile) = default_profile {
                    config.set_target_profile(profile);
                }
            }
        }

        if let Some(resource) = element
            .children()
            .find(|c| c.is_element() && c.tag_name().name() == "resource")
        {
            if let Some(text) = resource.text() {
                let text = text.trim();
                if !text.is_empty() {
                    config.set_resource(text);
                }
            }
        }

        Ok(config)
    }
}

/// Name-keyed registry of resource-config factories.
///
/// The `factory` attribute of `<resource-config>` selects one of these; an
/// unregistered name is a configuration error carrying the name.
pub struct ResourceConfigFactoryRegistry {
    factories: std::collections::HashMap<String, Arc<dyn ResourceConfigFactory>>,
    default: Arc<dyn ResourceConfigFactory>,
}

impl Default for ResourceConfigFactoryRegistry {
    fn default() -> Self {
        Self {
            factories: std::collections::HashMap::new(),
            default: Arc::new(DefaultResourceConfigFactory),
        }
    }
}

impl ResourceConfigFactoryRegistry {
    /// Create a registry holding only the default factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named factory.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ResourceConfigFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Resolve a factory. `None` selects the default factory.
    pub fn resolve(
        &self,
        name: Option<&str>,
    ) -> Result<&Arc<dyn ResourceConfigFactory>, ConfigError> {
        match name {
            None => Ok(&self.default),
            Some(name) => {
                self.factories
                    .get(name)
                    .ok_or_else(|| ConfigError::FactoryInstantiation {
                        factory: name.to_string(),
                    })
            }
        }
    }
}

impl fmt::Debug for ResourceConfigFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfigFactoryRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
