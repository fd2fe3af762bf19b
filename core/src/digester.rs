//! The `.cdrl` configuration digester.
//!
//! Parses a cedra configuration document, recurses into imports (with
//! `@NAME@` parameter substitution and cycle detection over a stack of
//! configuration frames), dispatches built-in elements, and rewrites
//! foreign-namespace elements through nested, cached extension digesters.
//!
//! Digestion is single-threaded per task. Whether a digester is processing
//! an extension configuration is carried explicitly as a [`DigestMode`]
//! argument, never as process-global state, so concurrent digestions and
//! re-entrant extension processing cannot corrupt each other.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ConfigError, FilterError};
use crate::expression::{ExpressionEvaluator, ExpressionEvaluatorFactory};
use crate::filter::{ExecutionContext, Filter};
use crate::interceptor::InterceptorChainFactory;
use crate::param::{ParamType, ParameterMap};
use crate::planner::{ContentDeliveryConfig, FilterProvider, StreamFilterProvider};
use crate::resource::{
    ResourceConfig, ResourceConfigFactoryRegistry, GLOBAL_PARAMETERS, READER_SELECTOR,
    SELECTOR_NONE,
};
use crate::selector::PathElement;
use crate::seq::ResourceConfigSeq;
use crate::uri;
use crate::visitor::{BeforeVisitor, Visitor, VisitorRegistry, VisitorRegistryBuilder};
use crate::{profile::ProfileSet, NS_CDRL_20};

/// Local name of the configuration root element.
pub const ROOT_ELEMENT: &str = "cedra-resource-list";

/// Whether a digester is processing a root or an extension configuration.
///
/// Inside extension mode only `import` and `resource-config` elements are
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestMode {
    /// Ordinary configuration digestion.
    Root,
    /// Digestion of an extension descriptor (`-cedra.xml`).
    Extension,
}

/// Loads configuration resources by URI.
///
/// The seam through which imports and extension descriptors are read; the
/// classpath analog of the original environment.
pub trait ResourceLocator: Send + Sync {
    /// Read the resource at the given (normalized) URI.
    fn locate(&self, uri: &str) -> io::Result<String>;
}

/// Reads resources from the filesystem. A `file:` scheme prefix is
/// stripped; all other URIs are treated as plain paths.
#[derive(Debug, Default)]
pub struct FileResourceLocator;

impl ResourceLocator for FileResourceLocator {
    fn locate(&self, uri: &str) -> io::Result<String> {
        let path = uri.strip_prefix("file:").unwrap_or(uri);
        std::fs::read_to_string(path)
    }
}

/// An in-memory resource table, for tests and embedded configuration.
#[derive(Debug, Default)]
pub struct InMemoryResourceLocator {
    resources: HashMap<String, String>,
}

impl InMemoryResourceLocator {
    /// Create an empty locator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource under a URI.
    pub fn insert(&mut self, uri: impl Into<String>, content: impl Into<String>) {
        self.resources.insert(uri::normalize(&uri.into()), content.into());
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, uri: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(uri, content);
        self
    }
}

impl ResourceLocator for InMemoryResourceLocator {
    fn locate(&self, uri: &str) -> io::Result<String> {
        self.resources
            .get(&uri::normalize(uri))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no resource '{uri}'")))
    }
}

/// One frame of the digestion stack.
///
/// Frames give lexical scoping for condition `idRef` lookups: a lookup
/// walks outward through enclosing frames until found. No two frames on
/// the live stack may share a file URI (import cycle detection).
struct ConfigFrame {
    config_file: String,
    file_uri: Option<String>,
    default_ns: Option<String>,
    condition_evaluators: HashMap<String, Arc<dyn ExpressionEvaluator>>,
}

impl ConfigFrame {
    fn root() -> Self {
        Self {
            config_file: "root-config".to_string(),
            file_uri: None,
            default_ns: None,
            condition_evaluators: HashMap::new(),
        }
    }

    fn imported(config_file: &str, file_uri: &str) -> Self {
        Self {
            config_file: config_file.to_string(),
            file_uri: Some(file_uri.to_string()),
            default_ns: None,
            condition_evaluators: HashMap::new(),
        }
    }
}

/// Digester for a `.cdrl` resource configuration stream.
pub struct XmlConfigDigester<'a> {
    seq: ResourceConfigSeq,
    stack: Vec<ConfigFrame>,
    evaluators: ExpressionEvaluatorFactory,
    factories: ResourceConfigFactoryRegistry,
    locator: &'a dyn ResourceLocator,
    visitors: &'a VisitorRegistry,
    extensions: &'a mut ExtensionDigesters,
    mode: DigestMode,
}

/// Digest a configuration stream into a resource config sequence.
///
/// `base_uri` is associated with the stream and anchors relative imports.
/// Previously-built extension digesters in `extensions` are reused;
/// newly-encountered extension namespaces are added to it.
pub fn digest_config(
    source: &str,
    base_uri: &str,
    locator: &dyn ResourceLocator,
    visitors: &VisitorRegistry,
    extensions: &mut ExtensionDigesters,
) -> Result<ResourceConfigSeq, ConfigError> {
    let mut digester = XmlConfigDigester {
        seq: ResourceConfigSeq::new(base_uri),
        stack: vec![ConfigFrame::root()],
        evaluators: ExpressionEvaluatorFactory::new(),
        factories: ResourceConfigFactoryRegistry::new(),
        locator,
        visitors,
        extensions,
        mode: DigestMode::Root,
    };
    digester.digest_nested(source, base_uri)?;
    Ok(digester.seq)
}

impl<'a> XmlConfigDigester<'a> {
    /// The stack-rendered path of the configuration currently being
    /// digested, e.g. `/[root-config]/[imported.xml]`.
    #[must_use]
    pub fn current_path(&self) -> String {
        let mut path = String::new();
        for frame in &self.stack {
            path.push_str("/[");
            path.push_str(&frame.config_file);
            path.push(']');
        }
        path
    }

    /// The default namespace of the document on top of the stack.
    #[must_use]
    pub fn current_default_namespace(&self) -> Option<&str> {
        self.stack
            .last()
            .and_then(|frame| frame.default_ns.as_deref())
    }

    fn digest_nested(&mut self, source: &str, base_uri: &str) -> Result<(), ConfigError> {
        self.digest_document(source, base_uri)
            .map_err(|e| e.at(self.current_path()))
    }

    fn digest_document(&mut self, source: &str, base_uri: &str) -> Result<(), ConfigError> {
        let doc = roxmltree::Document::parse(source)?;
        let root = doc.root_element();

        let default_ns = root.tag_name().namespace().unwrap_or("").to_string();
        if default_ns != NS_CDRL_20 {
            return Err(ConfigError::UnsupportedNamespace {
                namespace: default_ns,
            });
        }
        if root.tag_name().name() != ROOT_ELEMENT {
            return Err(ConfigError::SchemaInvalid {
                reason: format!(
                    "expected root element '{ROOT_ELEMENT}', found '{}'",
                    root.tag_name().name()
                ),
            });
        }
        if let Some(frame) = self.stack.last_mut() {
            frame.default_ns = Some(default_ns);
        }

        let default_profile = root.attribute("default-target-profile");
        let default_condition_ref = root.attribute("default-condition-ref");

        for child in root.children().filter(roxmltree::Node::is_element) {
            self.assert_element_permitted(&child)?;

            let name = child.tag_name().name();
            if child.tag_name().namespace() == Some(NS_CDRL_20) {
                match name {
                    "params" => self.digest_params(&child)?,
                    "conditions" => self.digest_conditions(&child)?,
                    "profiles" => self.digest_profiles(&child)?,
                    "import" => self.digest_import(&child, base_uri, source)?,
                    "reader" => self.digest_reader(&child, default_profile)?,
                    "resource-config" => {
                        self.digest_resource_config(&child, default_profile, default_condition_ref)?
                    }
                    other => {
                        return Err(ConfigError::SchemaInvalid {
                            reason: format!("unknown configuration element '{other}'"),
                        })
                    }
                }
            } else {
                self.digest_extension_element(
                    &child,
                    source,
                    default_profile,
                    default_condition_ref,
                )?;
            }
        }

        if self.seq.is_empty() {
            return Err(ConfigError::EmptyConfiguration);
        }
        Ok(())
    }

    fn assert_element_permitted(&self, element: &roxmltree::Node<'_, '_>) -> Result<(), ConfigError> {
        if self.mode == DigestMode::Extension {
            let name = element.tag_name().name();
            if name != "import" && name != "resource-config" {
                return Err(ConfigError::IllegalExtensionElement {
                    element: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn digest_params(&mut self, element: &roxmltree::Node<'_, '_>) -> Result<(), ConfigError> {
        let mut global = ResourceConfig::new(GLOBAL_PARAMETERS, &BTreeMap::new(), &self.evaluators)?;
        self.digest_parameters(element, &mut global)?;
        if !global.params().is_empty() {
            self.seq.add(global);
        }
        Ok(())
    }

    fn digest_parameters(
        &self,
        element: &roxmltree::Node<'_, '_>,
        config: &mut ResourceConfig,
    ) -> Result<(), ConfigError> {
        for param in element
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "param")
        {
            let name = param
                .attribute("name")
                .ok_or_else(|| ConfigError::SchemaInvalid {
                    reason: "param requires a 'name' attribute".to_string(),
                })?;
            let value = element_text(&param);
            match param.attribute("type") {
                None => config.set_parameter(name, value),
                Some(type_name) => {
                    let param_type: ParamType =
                        type_name.parse().map_err(|()| ConfigError::ParamDecode {
                            name: name.to_string(),
                            value: value.clone(),
                            param_type: type_name.to_string(),
                        })?;
                    // Decode eagerly so bad values fail the digestion task.
                    let parameter = crate::param::Parameter::typed(name, &value, param_type);
                    parameter.decode()?;
                    config.set_typed_parameter(name, value, param_type);
                }
            }
        }
        Ok(())
    }

    fn digest_conditions(&mut self, element: &roxmltree::Node<'_, '_>) -> Result<(), ConfigError> {
        for condition in element
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "condition")
        {
            if let Some(id) = condition.attribute("id") {
                let evaluator = self.digest_condition(&condition)?;
                self.add_condition_evaluator(id, evaluator)?;
            }
        }
        Ok(())
    }

    /// Digest one `<condition>` element: by `idRef`, or inline from the
    /// `evaluator` attribute and the expression text.
    fn digest_condition(
        &self,
        element: &roxmltree::Node<'_, '_>,
    ) -> Result<Arc<dyn ExpressionEvaluator>, ConfigError> {
        if let Some(id_ref) = element.attribute("idRef") {
            return self.get_condition_evaluator(id_ref);
        }
        let evaluator = element.attribute("evaluator");
        self.evaluators.create(evaluator, &element_text(element))
    }

    fn digest_profiles(&mut self, element: &roxmltree::Node<'_, '_>) -> Result<(), ConfigError> {
        for profile in element.children().filter(roxmltree::Node::is_element) {
            let base =
                profile
                    .attribute("base-profile")
                    .ok_or_else(|| ConfigError::SchemaInvalid {
                        reason: "profile requires a 'base-profile' attribute".to_string(),
                    })?;
            let mut profile_set = ProfileSet::new(base);
            if let Some(sub_profiles) = profile.attribute("sub-profiles") {
                profile_set.add_profiles(sub_profiles.split(','));
            }
            self.seq.add_profile_set(profile_set);
        }
        Ok(())
    }

    fn digest_import(
        &mut self,
        element: &roxmltree::Node<'_, '_>,
        base_uri: &str,
        doc_source: &str,
    ) -> Result<(), ConfigError> {
        let file = element
            .attribute("file")
            .ok_or_else(|| ConfigError::SchemaInvalid {
                reason: "invalid resource import: 'file' attribute must be specified".to_string(),
            })?;
        let file_uri = uri::resolve(base_uri, file);

        // Will fail if the URI is already being digested.
        self.push_config(file, &file_uri)?;
        let result = self.digest_import_inner(element, file, &file_uri, doc_source);
        self.pop_config();
        result
    }

    fn digest_import_inner(
        &mut self,
        element: &roxmltree::Node<'_, '_>,
        file: &str,
        file_uri: &str,
        doc_source: &str,
    ) -> Result<(), ConfigError> {
        debug!(file, uri = file_uri, "importing resource configuration");

        let mut content = self
            .locator
            .locate(file_uri)
            .map_err(|e| ConfigError::ImportIo {
                file: file.to_string(),
                source: e,
            })?;

        for param in element
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "param")
        {
            let name = param
                .attribute("name")
                .ok_or_else(|| ConfigError::SchemaInvalid {
                    reason: "import param requires a 'name' attribute".to_string(),
                })?;
            let value = inner_xml(&param, doc_source);
            content = content.replace(&format!("@{name}@"), &value);
        }

        // The file's parent URI becomes the new base URI.
        self.digest_nested(&content, &uri::parent(file_uri))
    }

    fn digest_reader(
        &mut self,
        element: &roxmltree::Node<'_, '_>,
        default_profile: Option<&str>,
    ) -> Result<(), ConfigError> {
        let mut config = ResourceConfig::new(READER_SELECTOR, &BTreeMap::new(), &self.evaluators)?;
        if let Some(class) = element.attribute("class") {
            config.set_resource(class);
        }
        if let Some(profile) = element.attribute("targetProfile").or(default_profile) {
            config.set_target_profile(profile);
        }

        if let Some(handlers) = child_element(element, "handlers") {
            for handler in handlers.children().filter(roxmltree::Node::is_element) {
                if let Some(class) = handler.attribute("class") {
                    config.set_parameter("sax-handler", class);
                }
            }
        }

        if let Some(features) = child_element(element, "features") {
            for feature in features.children().filter(roxmltree::Node::is_element) {
                if let Some(uri) = feature.attribute("feature") {
                    let name = if feature.tag_name().name() == "setOn" {
                        "feature-on"
                    } else {
                        "feature-off"
                    };
                    config.set_parameter(name, uri);
                }
            }
        }

        if let Some(params) = child_element(element, "params") {
            for param in params
                .children()
                .filter(|n| n.is_element() && n.tag_name().name() == "param")
            {
                let name = param
                    .attribute("name")
                    .ok_or_else(|| ConfigError::SchemaInvalid {
                        reason: "param requires a 'name' attribute".to_string(),
                    })?;
                config.set_parameter(name, element_text(&param));
            }
        }

        self.seq.add(config);
        Ok(())
    }

    fn digest_resource_config(
        &mut self,
        element: &roxmltree::Node<'_, '_>,
        default_profile: Option<&str>,
        default_condition_ref: Option<&str>,
    ) -> Result<(), ConfigError> {
        let factory = self.factories.resolve(element.attribute("factory"))?;
        let namespaces = namespaces_in_scope(element);
        let mut config =
            factory.create(default_profile, element, &namespaces, &self.evaluators)?;

        if let Some(condition) = child_element(element, "condition") {
            let evaluator = self.digest_condition(&condition)?;
            config.selector_path_mut().set_condition(evaluator);
        } else if let Some(id_ref) = default_condition_ref {
            let evaluator = self.get_condition_evaluator(id_ref)?;
            config.selector_path_mut().set_condition(evaluator);
        }

        self.digest_parameters(element, &mut config)?;

        debug!(config = %config, seq = self.seq.name(), "adding resource config");
        self.seq.add(config);
        Ok(())
    }

    fn digest_extension_element(
        &mut self,
        element: &roxmltree::Node<'_, '_>,
        doc_source: &str,
        default_profile: Option<&str>,
        default_condition_ref: Option<&str>,
    ) -> Result<(), ConfigError> {
        let namespace = element
            .tag_name()
            .namespace()
            .ok_or_else(|| ConfigError::SchemaInvalid {
                reason: format!(
                    "element '{}' is in no namespace",
                    element.tag_name().name()
                ),
            })?
            .to_string();

        let digester = self.extension_digester(&namespace)?;

        let condition = match child_element(element, "condition") {
            Some(condition) if condition.tag_name().namespace() == Some(NS_CDRL_20) => {
                Some(self.digest_condition(&condition)?)
            }
            _ => match default_condition_ref {
                Some(id_ref) => Some(self.get_condition_evaluator(id_ref)?),
                None => None,
            },
        };

        let ext = ExtensionContext::new(default_profile.map(str::to_string), condition);
        let element_xml = &doc_source[element.range()];
        let resources = digester.apply(element_xml, ext, &self.evaluators)?;
        for resource in resources {
            self.seq.add(resource);
        }
        Ok(())
    }

    /// Get (or construct and cache) the nested digester for an extension
    /// namespace.
    fn extension_digester(
        &mut self,
        namespace: &str,
    ) -> Result<Arc<ExtensionDigester>, ConfigError> {
        if let Some(existing) = self.extensions.get(namespace) {
            return Ok(existing);
        }

        let resource_path = extension_resource_path(namespace)?;
        let content =
            self.locator
                .locate(&resource_path)
                .map_err(|_| ConfigError::ExtensionResourceMissing {
                    resource_path: resource_path.clone(),
                    namespace: namespace.to_string(),
                })?;

        {
            let descriptor = roxmltree::Document::parse(&content)?;
            let descriptor_ns = descriptor.root_element().tag_name().namespace().unwrap_or("");
            if descriptor_ns != NS_CDRL_20 {
                return Err(ConfigError::SchemaInvalid {
                    reason: format!(
                        "extension configuration '{resource_path}' default namespace must be \
                         the cedra configuration namespace"
                    ),
                });
            }
        }

        debug!(namespace, resource_path = %resource_path, "constructing extension digester");
        let base_uri = uri::parent(&resource_path);
        let seq = {
            let mut nested = XmlConfigDigester {
                seq: ResourceConfigSeq::new(&base_uri),
                stack: vec![ConfigFrame::root()],
                evaluators: ExpressionEvaluatorFactory::new(),
                factories: ResourceConfigFactoryRegistry::new(),
                locator: self.locator,
                visitors: self.visitors,
                extensions: &mut *self.extensions,
                mode: DigestMode::Extension,
            };
            nested.digest_nested(&content, &base_uri)?;
            nested.seq
        };

        let mut bindings = Vec::new();
        for config in seq.resource_configs() {
            bindings.push(self.visitors.require_binding(config)?);
        }
        let delivery = StreamFilterProvider.create_content_delivery_config(
            &bindings,
            &BTreeMap::new(),
            &InterceptorChainFactory::new(),
        )?;

        let digester = Arc::new(ExtensionDigester {
            namespace: namespace.to_string(),
            delivery,
        });
        self.extensions
            .insert(namespace, Arc::clone(&digester));
        Ok(digester)
    }

    fn push_config(&mut self, file: &str, file_uri: &str) -> Result<(), ConfigError> {
        for frame in &self.stack {
            if frame.file_uri.as_deref() == Some(file_uri) {
                return Err(ConfigError::ImportCycle {
                    uri: file_uri.to_string(),
                    from: self.current_path(),
                });
            }
        }
        self.stack.push(ConfigFrame::imported(file, file_uri));
        Ok(())
    }

    fn pop_config(&mut self) {
        self.stack.pop();
    }

    fn add_condition_evaluator(
        &mut self,
        id: &str,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Result<(), ConfigError> {
        let Some(frame) = self.stack.last_mut() else {
            return Err(ConfigError::SchemaInvalid {
                reason: "no active configuration frame".to_string(),
            });
        };
        if frame.condition_evaluators.contains_key(id) {
            return Err(ConfigError::DuplicateConditionId { id: id.to_string() });
        }
        frame.condition_evaluators.insert(id.to_string(), evaluator);
        Ok(())
    }

    fn get_condition_evaluator(
        &self,
        id_ref: &str,
    ) -> Result<Arc<dyn ExpressionEvaluator>, ConfigError> {
        for frame in self.stack.iter().rev() {
            if let Some(evaluator) = frame.condition_evaluators.get(id_ref) {
                return Ok(Arc::clone(evaluator));
            }
        }
        Err(ConfigError::UnknownConditionIdRef {
            id_ref: id_ref.to_string(),
        })
    }
}

/// Concatenated text content of an element (descendant text nodes).
fn element_text(element: &roxmltree::Node<'_, '_>) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        if node.is_text() {
            out.push_str(node.text().unwrap_or(""));
        }
    }
    out.trim().to_string()
}

/// The first direct child element with the given local name.
fn child_element<'a, 'input>(
    element: &roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    element
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

/// The XML-serialized inner content of an element, markup included.
fn inner_xml(element: &roxmltree::Node<'_, '_>, source: &str) -> String {
    let mut children = element.children();
    let Some(first) = children.next() else {
        return String::new();
    };
    let last = children.last().unwrap_or(first);
    source[first.range().start..last.range().end].to_string()
}

fn namespaces_in_scope(element: &roxmltree::Node<'_, '_>) -> BTreeMap<String, String> {
    let mut namespaces = BTreeMap::new();
    for ns in element.namespaces() {
        if let Some(prefix) = ns.name() {
            namespaces.insert(prefix.to_string(), ns.uri().to_string());
        }
    }
    namespaces
}

/// Map an extension namespace URI to its descriptor resource path:
/// `/META-INF<namespace-path>-cedra.xml`.
fn extension_resource_path(namespace: &str) -> Result<String, ConfigError> {
    let path = if let Some(idx) = namespace.find("://") {
        let rest = &namespace[idx + 3..];
        match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => "",
        }
    } else if let Some((_, rest)) = namespace.split_once(':') {
        if rest.starts_with('/') {
            rest
        } else {
            ""
        }
    } else if namespace.starts_with('/') {
        namespace
    } else {
        ""
    };

    if path.is_empty() {
        return Err(ConfigError::SchemaInvalid {
            reason: format!("extension namespace '{namespace}' has no path component"),
        });
    }
    Ok(format!("/META-INF{path}-cedra.xml"))
}

/// Cache of nested extension digesters, keyed by namespace URI.
///
/// Shared across digestion calls so repeated use of a namespace reuses the
/// same digester instance.
#[derive(Debug, Default)]
pub struct ExtensionDigesters {
    digesters: HashMap<String, Arc<ExtensionDigester>>,
}

impl ExtensionDigesters {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the digester for a namespace.
    #[must_use]
    pub fn get(&self, namespace: &str) -> Option<Arc<ExtensionDigester>> {
        self.digesters.get(namespace).cloned()
    }

    fn insert(&mut self, namespace: &str, digester: Arc<ExtensionDigester>) {
        self.digesters.insert(namespace.to_string(), digester);
    }

    /// Number of cached digesters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.digesters.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.digesters.is_empty()
    }
}

/// A self-contained digester for one extension namespace: the compiled
/// dispatch pipeline of its descriptor's visitor bindings.
#[derive(Debug)]
pub struct ExtensionDigester {
    namespace: String,
    delivery: ContentDeliveryConfig,
}

impl ExtensionDigester {
    /// The namespace this digester serves.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Filter an extension element subtree through this digester's
    /// pipeline, collecting the resource configs its visitors produce.
    fn apply(
        &self,
        element_xml: &str,
        ext: ExtensionContext,
        evaluators: &ExpressionEvaluatorFactory,
    ) -> Result<Vec<ResourceConfig>, ConfigError> {
        let mut ctx = ExecutionContext::new();
        ctx.put(ext);

        Filter::new(&self.delivery)
            .filter(element_xml, &mut ctx)
            .map_err(|e| ConfigError::ExtensionProcessing {
                namespace: self.namespace.clone(),
                reason: e.to_string(),
            })?;

        let ext: ExtensionContext =
            ctx.remove()
                .ok_or_else(|| ConfigError::ExtensionProcessing {
                    namespace: self.namespace.clone(),
                    reason: "extension context was removed during filtering".to_string(),
                })?;
        ext.into_resource_configs(evaluators)
    }
}

/// State carried through an extension element's filtering run.
///
/// Extension visitors open resource configs and map element data onto
/// them; the digester copies the finished configs into the outer sequence
/// in order.
#[derive(Debug)]
pub struct ExtensionContext {
    default_profile: Option<String>,
    default_condition: Option<Arc<dyn ExpressionEvaluator>>,
    pending: Vec<PendingResourceConfig>,
}

/// A resource config under construction by extension visitors.
///
/// The selector stays a string until the run finishes, so mapping visitors
/// can rewrite it freely; compilation happens once at the end.
#[derive(Debug)]
pub struct PendingResourceConfig {
    /// Selector string; starts as the `none` placeholder.
    pub selector: String,
    /// Resource locator.
    pub resource: Option<String>,
    /// Target profile.
    pub target_profile: Option<String>,
    /// Condition evaluator.
    pub condition: Option<Arc<dyn ExpressionEvaluator>>,
    /// Parameters accumulated so far.
    pub params: ParameterMap,
}

impl ExtensionContext {
    fn new(
        default_profile: Option<String>,
        default_condition: Option<Arc<dyn ExpressionEvaluator>>,
    ) -> Self {
        Self {
            default_profile,
            default_condition,
            pending: Vec::new(),
        }
    }

    /// Open a fresh resource config; it becomes the current one.
    pub fn open(&mut self, selector: Option<String>, resource: Option<String>) {
        self.pending.push(PendingResourceConfig {
            selector: selector.unwrap_or_else(|| SELECTOR_NONE.to_string()),
            resource,
            target_profile: self.default_profile.clone(),
            condition: self.default_condition.clone(),
            params: ParameterMap::new(),
        });
    }

    /// The resource config most recently opened.
    pub fn current_mut(&mut self) -> Option<&mut PendingResourceConfig> {
        self.pending.last_mut()
    }

    fn into_resource_configs(
        self,
        evaluators: &ExpressionEvaluatorFactory,
    ) -> Result<Vec<ResourceConfig>, ConfigError> {
        let mut configs = Vec::with_capacity(self.pending.len());
        for pending in self.pending {
            let mut config =
                ResourceConfig::new(&pending.selector, &BTreeMap::new(), evaluators)?;
            if let Some(resource) = pending.resource {
                config.set_resource(resource);
            }
            if let Some(profile) = pending.target_profile {
                config.set_target_profile(profile);
            }
            if let Some(condition) = pending.condition {
                config.selector_path_mut().set_condition(condition);
            }
            config.params_mut().extend_from(&pending.params);
            configs.push(config);
        }
        Ok(configs)
    }
}

/// Register the built-in extension visitors on a registry builder.
///
/// - `new-resource-config`: opens a fresh resource config on the extension
///   context when its selector matches. Optional params `selector` and
///   `resource` seed the new config.
/// - `map-to-attribute`: maps an attribute of the matched element onto the
///   open config. Param `attribute` names the source attribute; `mapTo`
///   (defaulting to the attribute name) is `selector`, `resource`, or a
///   parameter name.
pub(crate) fn register_extension_visitors(builder: &mut VisitorRegistryBuilder) {
    builder.insert("new-resource-config", |config| {
        Ok(Arc::new(NewResourceConfigVisitor {
            selector: config.params().first("selector").map(|p| p.value.clone()),
            resource: config.params().first("resource").map(|p| p.value.clone()),
        }) as Arc<dyn Visitor>)
    });
    builder.insert("map-to-attribute", |config| {
        let attribute = config
            .params()
            .first("attribute")
            .map(|p| p.value.clone())
            .ok_or_else(|| ConfigError::SchemaInvalid {
                reason: "map-to-attribute requires an 'attribute' param".to_string(),
            })?;
        let map_to = config
            .params()
            .first("mapTo")
            .map(|p| p.value.clone())
            .unwrap_or_else(|| attribute.clone());
        Ok(Arc::new(MapToAttributeVisitor { attribute, map_to }) as Arc<dyn Visitor>)
    });
}

#[derive(Debug)]
struct NewResourceConfigVisitor {
    selector: Option<String>,
    resource: Option<String>,
}

impl Visitor for NewResourceConfigVisitor {
    fn as_before(&self) -> Option<&dyn BeforeVisitor> {
        Some(self)
    }
}

impl BeforeVisitor for NewResourceConfigVisitor {
    fn visit_before(
        &self,
        _element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        let ext = ctx
            .get_mut::<ExtensionContext>()
            .ok_or_else(|| FilterError::custom("no extension context in execution"))?;
        ext.open(self.selector.clone(), self.resource.clone());
        Ok(())
    }
}

#[derive(Debug)]
struct MapToAttributeVisitor {
    attribute: String,
    map_to: String,
}

impl Visitor for MapToAttributeVisitor {
    fn as_before(&self) -> Option<&dyn BeforeVisitor> {
        Some(self)
    }
}

impl BeforeVisitor for MapToAttributeVisitor {
    fn visit_before(
        &self,
        element: &PathElement,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        let Some(value) = element.attribute(&self.attribute).map(str::to_string) else {
            return Ok(());
        };
        let ext = ctx
            .get_mut::<ExtensionContext>()
            .ok_or_else(|| FilterError::custom("no extension context in execution"))?;
        let pending = ext
            .current_mut()
            .ok_or_else(|| FilterError::custom("no open resource config to map onto"))?;
        match self.map_to.as_str() {
            "selector" => pending.selector = value,
            "resource" => pending.resource = Some(value),
            param => pending.params.set(param, value),
        }
        Ok(())
    }
}
