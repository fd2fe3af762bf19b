//! Error types for configuration digestion and execution-time filtering.
//!
//! Two families:
//!
//! - [`ConfigError`] - raised while digesting a `.cdrl` document or planning
//!   dispatch indices. Fatal to the digestion task: no partial sequence is
//!   ever delivered.
//! - [`FilterError`] - raised while filtering a source document. Visitor
//!   failures are wrapped with the failing selector and resource identity by
//!   the interceptor chain.
//!
//! The digester annotates every error leaving it with the current config
//! path (`/[root-config]/[imported.xml]`) via [`ConfigError::at`].

use std::time::Duration;

use thiserror::Error;

/// Errors raised while digesting a `.cdrl` configuration or building
/// dispatch indices from it.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration stream is not well-formed XML.
    #[error("unable to parse configuration: {0}")]
    XmlSyntax(#[from] roxmltree::Error),

    /// The document does not match the expected configuration shape.
    #[error("invalid configuration: {reason}")]
    SchemaInvalid {
        /// What shape rule was violated.
        reason: String,
    },

    /// The root default namespace is not the supported cedra namespace.
    #[error("cannot parse configuration: unsupported default namespace '{namespace}'")]
    UnsupportedNamespace {
        /// The namespace that was found on the root element.
        namespace: String,
    },

    /// Digestion produced zero resource definitions.
    #[error("invalid content delivery resource definition file: 0 content delivery resource definitions")]
    EmptyConfiguration,

    /// An `<import>` file URI is already on the digestion stack.
    #[error("invalid circular reference to config file '{uri}' from inside config file '{from}'")]
    ImportCycle {
        /// The normalized URI that closed the cycle.
        uri: String,
        /// The stack-rendered path of the importing file.
        from: String,
    },

    /// An imported resource could not be read.
    #[error("failed to load configuration resource <import> '{file}': {source}")]
    ImportIo {
        /// The `file` attribute of the failing import.
        file: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A condition `idRef` has no binding in the frame chain.
    #[error("unknown condition idRef '{id_ref}'")]
    UnknownConditionIdRef {
        /// The unresolved reference.
        id_ref: String,
    },

    /// A condition id was reused within one configuration frame.
    #[error("duplicate condition id '{id}'")]
    DuplicateConditionId {
        /// The duplicated id.
        id: String,
    },

    /// A `<condition>` element carried no expression text.
    #[error("condition must specify an expression as child text, e.g. <condition evaluator=\"...\">a == 'b'</condition>")]
    EmptyConditionExpression,

    /// A non-import, non-resource-config element inside an extension
    /// configuration.
    #[error("configuration element '{element}' not supported in an extension configuration")]
    IllegalExtensionElement {
        /// Local name of the offending element.
        element: String,
    },

    /// The extension descriptor for a namespace could not be located.
    #[error("unable to locate extension digest configuration '{resource_path}' for namespace '{namespace}'; this resource must be available to the resource locator")]
    ExtensionResourceMissing {
        /// The `/META-INF...-cedra.xml` path that was probed.
        resource_path: String,
        /// The extension namespace URI.
        namespace: String,
    },

    /// Filtering an extension element through its nested digester failed.
    #[error("failed to process extension configuration for namespace '{namespace}': {reason}")]
    ExtensionProcessing {
        /// The extension namespace URI.
        namespace: String,
        /// Rendered cause.
        reason: String,
    },

    /// A selector string could not be compiled, or a compiled selector is
    /// unsupported for the visitor bound to it.
    #[error("unsupported selector '{selector}': {reason}")]
    InvalidSelector {
        /// The offending selector string.
        selector: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A `factory` attribute named an unregistered resource-config factory.
    #[error("unable to instantiate resource config factory '{factory}'")]
    FactoryInstantiation {
        /// The factory name from the `factory` attribute.
        factory: String,
    },

    /// An evaluator name had no registered constructor.
    #[error("unable to instantiate expression evaluator '{evaluator}'")]
    EvaluatorInstantiation {
        /// The evaluator name.
        evaluator: String,
    },

    /// An expression could not be compiled by its evaluator.
    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression {
        /// The expression text.
        expression: String,
        /// Why compilation failed.
        reason: String,
    },

    /// A typed parameter value failed to decode.
    #[error("unable to decode parameter '{name}' value '{value}' as {param_type}")]
    ParamDecode {
        /// Parameter name.
        name: String,
        /// Raw value text.
        value: String,
        /// The declared type.
        param_type: String,
    },

    /// A resource named a visitor with no registered factory.
    #[error("no visitor registered for resource '{resource}'")]
    UnknownVisitor {
        /// The resource locator string.
        resource: String,
    },

    /// A profile lookup failed.
    #[error("unknown profile '{profile}'")]
    UnknownProfile {
        /// The requested base profile.
        profile: String,
    },

    /// An error annotated with the digestion stack path at which it occurred.
    #[error("{source} (config path {path})")]
    At {
        /// Stack-rendered config path, e.g. `/[root-config]/[a.xml]`.
        path: String,
        /// The underlying error.
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    /// Annotate an error with the digestion stack path it occurred at.
    ///
    /// Already-annotated errors are returned unchanged so nested digestion
    /// keeps the innermost (most precise) path.
    pub fn at(self, path: impl Into<String>) -> Self {
        match self {
            already @ ConfigError::At { .. } => already,
            other => ConfigError::At {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// Strip the path annotation, if any, exposing the underlying kind.
    pub fn kind(&self) -> &ConfigError {
        match self {
            ConfigError::At { source, .. } => source.kind(),
            other => other,
        }
    }
}

/// Errors raised while filtering a source document at execution time.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The source document is not well-formed XML.
    #[error("unable to parse source document: {reason}")]
    XmlSyntax {
        /// Rendered parser error.
        reason: String,
    },

    /// No pooled reader became free within the configured timeout.
    #[error("timed out after {timeout:?} waiting for a pooled reader")]
    ReaderAcquireTimeout {
        /// The configured acquire timeout.
        timeout: Duration,
    },

    /// A reader feature name was not recognized.
    #[error("unsupported reader feature '{feature}'")]
    UnsupportedFeature {
        /// The feature URI/name from the configuration.
        feature: String,
    },

    /// A visitor failed; annotated with the selector and resource identity
    /// it was registered under.
    #[error("visitor for selector '{selector}' (resource '{resource}') failed: {source}")]
    Visitor {
        /// The selector the visitor was bound to.
        selector: String,
        /// The resource identity of the binding.
        resource: String,
        /// The underlying failure.
        #[source]
        source: Box<FilterError>,
    },

    /// A visitor-supplied failure.
    #[error("{0}")]
    Custom(String),
}

impl FilterError {
    /// Build a visitor-supplied failure from any displayable value.
    pub fn custom(message: impl Into<String>) -> Self {
        FilterError::Custom(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_keeps_innermost_path() {
        let err = ConfigError::EmptyConditionExpression
            .at("/[root-config]/[a.xml]")
            .at("/[root-config]");

        match &err {
            ConfigError::At { path, .. } => assert_eq!(path, "/[root-config]/[a.xml]"),
            other => panic!("expected At, got {other:?}"),
        }
        assert!(matches!(err.kind(), ConfigError::EmptyConditionExpression));
    }

    #[test]
    fn import_cycle_message_names_the_uri() {
        let err = ConfigError::ImportCycle {
            uri: "root/a.xml".to_string(),
            from: "/[root-config]/[b.xml]".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("a.xml"));
        assert!(message.contains("circular"));
    }
}
