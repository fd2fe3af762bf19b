//! Selector-path compiler.
//!
//! Turns XPath-subset selector strings into a normalized sequence of
//! [`SelectorStep`]s with predicates. Grammar:
//!
//! ```text
//! selector  := '/'? step ('/' step)*
//! step      := name_test predicate*
//! name_test := '*' | qname | 'text()' | '@' qname
//! predicate := '[' expr ']'
//! expr      := integer | name ('=' | '==') literal | arbitrary-expression
//! ```
//!
//! A leading `/` yields an initial [`SelectorStep::Document`] step.
//! `text()` yields a [`SelectorStep::Text`] step and marks the containing
//! element step as text-accessing. Integer predicates (1-based) become
//! position predicates; anything that is not an integer or an
//! attribute-equals form is handed to the expression-evaluator factory.
//! Namespace prefixes resolve against the supplied prefix table at compile
//! time, so later reuse needs no prefix-mapping state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::expression::{ExpressionContext, ExpressionEvaluator, ExpressionEvaluatorFactory};

/// The wildcard dispatch key used for selector paths that do not end in an
/// element step.
pub const WILDCARD_SELECTOR: &str = "*";

/// A qualified name with its prefix resolved at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QName {
    /// The prefix as written, if any.
    pub prefix: Option<String>,
    /// The namespace URI the prefix resolved to, if any.
    pub namespace: Option<String>,
    /// Local part.
    pub local: String,
}

impl QName {
    /// A name with no prefix and no namespace.
    #[must_use]
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            namespace: None,
            local: local.into(),
        }
    }

    fn parse(
        token: &str,
        selector: &str,
        namespaces: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        match token.split_once(':') {
            Some((prefix, local)) => {
                let namespace =
                    namespaces
                        .get(prefix)
                        .cloned()
                        .ok_or_else(|| ConfigError::InvalidSelector {
                            selector: selector.to_string(),
                            reason: format!("unbound namespace prefix '{prefix}'"),
                        })?;
                Ok(Self {
                    prefix: Some(prefix.to_string()),
                    namespace: Some(namespace),
                    local: local.to_string(),
                })
            }
            None => Ok(Self::local(token)),
        }
    }

    /// Whether this name matches a document element name.
    ///
    /// The wildcard local name matches anything. A namespace is only
    /// required to agree when the selector declared one.
    #[must_use]
    pub fn matches(&self, local: &str, namespace: Option<&str>) -> bool {
        if self.local != WILDCARD_SELECTOR && self.local != local {
            return false;
        }
        match &self.namespace {
            Some(required) => namespace == Some(required.as_str()),
            None => true,
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{prefix}:{}", self.local),
            None => f.write_str(&self.local),
        }
    }
}

/// A predicate attached to an element step.
///
/// Predicates evaluate against the match candidate, left-to-right,
/// short-circuiting on the first `false`.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `[n]` - the candidate must be the n-th matching child (1-based).
    /// Requires a counter bound by the dispatch planner; an unbound
    /// position predicate never matches.
    Position {
        /// 1-based target position.
        position: usize,
        /// Counter slot allocated at plan time.
        counter: Option<usize>,
    },
    /// `[name = 'value']` - attribute equality on the candidate element.
    AttributeEquals {
        /// Attribute name (leading `@` stripped).
        name: QName,
        /// Required literal value.
        value: String,
    },
    /// Any other predicate body, compiled by the expression-evaluator
    /// factory and evaluated against the execution context's variables.
    Expression(Arc<dyn ExpressionEvaluator>),
}

impl Predicate {
    fn evaluate(&self, candidate: &PathElement, depth: usize, env: &dyn PredicateEnv) -> bool {
        match self {
            Predicate::Position { position, counter } => match counter {
                Some(id) => env.position_at(*id, depth) == *position,
                None => false,
            },
            Predicate::AttributeEquals { name, value } => candidate
                .attribute(&name.local)
                .is_some_and(|v| v == value),
            Predicate::Expression(evaluator) => evaluator.evaluate(env.vars()),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Position { position, .. } => write!(f, "[{position}]"),
            Predicate::AttributeEquals { name, value } => write!(f, "[{name} = '{value}']"),
            Predicate::Expression(evaluator) => write!(f, "[{}]", evaluator.expression()),
        }
    }
}

/// An element name test with its predicates.
#[derive(Debug, Clone)]
pub struct ElementStep {
    /// The element name test.
    pub qname: QName,
    /// Predicates, in source order.
    pub predicates: Vec<Predicate>,
    accesses_text: bool,
}

impl ElementStep {
    /// Whether a `text()` step follows this element in the selector.
    #[must_use]
    pub fn accesses_text(&self) -> bool {
        self.accesses_text
    }
}

/// One step of a compiled selector path.
#[derive(Debug, Clone)]
pub enum SelectorStep {
    /// The synthetic document root, produced by a leading `/`.
    Document,
    /// An element name test.
    Element(ElementStep),
    /// An attribute target (`@name`).
    Attribute(QName),
    /// A character-data target (`text()`).
    Text,
}

/// Counter and variable environment consulted during predicate evaluation.
///
/// Implemented by the execution context; position counters are scoped per
/// parent element, addressed by the depth of the candidate on the running
/// path.
pub trait PredicateEnv {
    /// The current count of the given counter in the parent frame of the
    /// element at `depth` on the running path.
    fn position_at(&self, counter: usize, depth: usize) -> usize;

    /// Condition variables.
    fn vars(&self) -> &ExpressionContext;
}

/// A no-counter, no-variable environment for matching outside an execution.
#[derive(Debug, Default)]
pub struct EmptyPredicateEnv {
    vars: ExpressionContext,
}

impl PredicateEnv for EmptyPredicateEnv {
    fn position_at(&self, _counter: usize, _depth: usize) -> usize {
        0
    }

    fn vars(&self) -> &ExpressionContext {
        &self.vars
    }
}

/// One element on the running document path, as seen by selectors and
/// visitors.
#[derive(Debug, Clone)]
pub struct PathElement {
    /// Local element name.
    pub local: String,
    /// Namespace URI, if the element is in one.
    pub namespace: Option<String>,
    /// Attributes as `(local name, value)` pairs in document order.
    pub attributes: Vec<(String, String)>,
}

impl PathElement {
    /// Create an element with no namespace and no attributes.
    #[must_use]
    pub fn named(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            namespace: None,
            attributes: Vec::new(),
        }
    }

    /// Look up an attribute by local name.
    #[must_use]
    pub fn attribute(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == local)
            .map(|(_, value)| value.as_str())
    }
}

/// An ordered sequence of selector steps plus the namespace prefix table
/// captured at compile time.
///
/// A path is *indexed* when its final step is an element; only indexed
/// paths participate in element dispatch under their own key, everything
/// else lands in the [`WILDCARD_SELECTOR`] bucket.
#[derive(Debug, Clone)]
pub struct SelectorPath {
    selector: String,
    steps: Vec<SelectorStep>,
    namespaces: BTreeMap<String, String>,
    condition: Option<Arc<dyn ExpressionEvaluator>>,
}

impl SelectorPath {
    /// Compile a selector string.
    pub fn parse(
        selector: &str,
        namespaces: &BTreeMap<String, String>,
        evaluators: &ExpressionEvaluatorFactory,
    ) -> Result<Self, ConfigError> {
        let trimmed = selector.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidSelector {
                selector: selector.to_string(),
                reason: "empty selector".to_string(),
            });
        }

        let mut steps: Vec<SelectorStep> = Vec::new();
        let mut rest = trimmed;
        if let Some(stripped) = rest.strip_prefix('/') {
            steps.push(SelectorStep::Document);
            rest = stripped;
        }

        for raw_step in split_steps(rest, trimmed)? {
            let (name_test, predicates) = split_predicates(&raw_step, trimmed)?;

            if name_test == "text()" {
                let marked = steps.iter_mut().rev().find_map(|step| match step {
                    SelectorStep::Element(element) => Some(element),
                    _ => None,
                });
                match marked {
                    Some(element) => element.accesses_text = true,
                    None => {
                        return Err(ConfigError::InvalidSelector {
                            selector: trimmed.to_string(),
                            reason: "text() requires a preceding element step".to_string(),
                        })
                    }
                }
                steps.push(SelectorStep::Text);
                continue;
            }

            if let Some(attr) = name_test.strip_prefix('@') {
                steps.push(SelectorStep::Attribute(QName::parse(
                    attr, trimmed, namespaces,
                )?));
                continue;
            }

            let qname = QName::parse(&name_test, trimmed, namespaces)?;
            let mut compiled = Vec::with_capacity(predicates.len());
            for body in predicates {
                compiled.push(compile_predicate(&body, trimmed, namespaces, evaluators)?);
            }
            steps.push(SelectorStep::Element(ElementStep {
                qname,
                predicates: compiled,
                accesses_text: false,
            }));
        }

        Ok(Self {
            selector: trimmed.to_string(),
            steps,
            namespaces: namespaces.clone(),
            condition: None,
        })
    }

    /// Build a path directly from compiled steps.
    ///
    /// Used by the dispatch planner to synthesize position-counter
    /// selectors from a path prefix without a reparse.
    #[must_use]
    pub(crate) fn from_steps(
        steps: Vec<SelectorStep>,
        namespaces: BTreeMap<String, String>,
    ) -> Self {
        let mut path = Self {
            selector: String::new(),
            steps,
            namespaces,
            condition: None,
        };
        path.selector = path.render();
        path
    }

    /// The source selector string.
    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// The compiled steps, in order.
    #[must_use]
    pub fn steps(&self) -> &[SelectorStep] {
        &self.steps
    }

    /// Mutable access to the compiled steps (plan-time counter binding).
    pub(crate) fn steps_mut(&mut self) -> &mut [SelectorStep] {
        &mut self.steps
    }

    /// The namespace prefix table captured at compile time.
    #[must_use]
    pub fn namespaces(&self) -> &BTreeMap<String, String> {
        &self.namespaces
    }

    /// Install a namespace table; keeps an existing non-empty table.
    pub fn set_namespaces(&mut self, namespaces: &BTreeMap<String, String>) {
        if self.namespaces.is_empty() {
            self.namespaces = namespaces.clone();
        }
    }

    /// The condition gating this path's resource, if any.
    #[must_use]
    pub fn condition(&self) -> Option<&Arc<dyn ExpressionEvaluator>> {
        self.condition.as_ref()
    }

    /// Attach a condition evaluator.
    pub fn set_condition(&mut self, evaluator: Arc<dyn ExpressionEvaluator>) {
        self.condition = Some(evaluator);
    }

    /// Whether the final step is an element step.
    #[must_use]
    pub fn is_indexed(&self) -> bool {
        matches!(self.steps.last(), Some(SelectorStep::Element(_)))
    }

    /// The dispatch key: the local name of the final element step, when the
    /// path is indexed.
    #[must_use]
    pub fn dispatch_key(&self) -> Option<&str> {
        match self.steps.last() {
            Some(SelectorStep::Element(element)) => Some(element.qname.local.as_str()),
            _ => None,
        }
    }

    /// The last element step anywhere in the path (the *target* element of
    /// `text()` and attribute selectors as well as plain element paths).
    #[must_use]
    pub fn target_element(&self) -> Option<&ElementStep> {
        self.steps.iter().rev().find_map(|step| match step {
            SelectorStep::Element(element) => Some(element),
            _ => None,
        })
    }

    fn element_steps(&self) -> impl Iterator<Item = &ElementStep> {
        self.steps.iter().filter_map(|step| match step {
            SelectorStep::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Whether the path is anchored at the document root.
    #[must_use]
    pub fn is_rooted(&self) -> bool {
        matches!(self.steps.first(), Some(SelectorStep::Document))
    }

    /// Match this path against the running element path.
    ///
    /// A rooted path must match the whole path from the document root; an
    /// unrooted path matches any suffix of the running path. Trailing
    /// `text()` and attribute steps address content of the target element
    /// and do not consume path elements. Predicates run left-to-right and
    /// short-circuit.
    #[must_use]
    pub fn matches(&self, path: &[PathElement], env: &dyn PredicateEnv) -> bool {
        let element_steps: Vec<&ElementStep> = self.element_steps().collect();
        if element_steps.is_empty() {
            // A document-only selector matches the root element.
            return self.is_rooted() && path.len() == 1;
        }
        if path.len() < element_steps.len() {
            return false;
        }
        if self.is_rooted() && path.len() != element_steps.len() {
            return false;
        }

        let offset = path.len() - element_steps.len();
        for (i, step) in element_steps.iter().enumerate() {
            let depth = offset + i;
            let candidate = &path[depth];
            if !step
                .qname
                .matches(&candidate.local, candidate.namespace.as_deref())
            {
                return false;
            }
            for predicate in &step.predicates {
                if !predicate.evaluate(candidate, depth, env) {
                    return false;
                }
            }
        }
        true
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let mut first = true;
        for step in &self.steps {
            match step {
                SelectorStep::Document => {
                    out.push('/');
                    continue;
                }
                SelectorStep::Element(element) => {
                    if !first && !out.ends_with('/') {
                        out.push('/');
                    }
                    out.push_str(&element.qname.to_string());
                    for predicate in &element.predicates {
                        out.push_str(&predicate.to_string());
                    }
                }
                SelectorStep::Attribute(qname) => {
                    if !first && !out.ends_with('/') {
                        out.push('/');
                    }
                    out.push('@');
                    out.push_str(&qname.to_string());
                }
                SelectorStep::Text => {
                    if !first && !out.ends_with('/') {
                        out.push('/');
                    }
                    out.push_str("text()");
                }
            }
            first = false;
        }
        out
    }
}

impl fmt::Display for SelectorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.selector)
    }
}

/// Split a selector body into raw steps on `/`, honoring predicate
/// brackets.
fn split_steps(body: &str, selector: &str) -> Result<Vec<String>, ConfigError> {
    let mut steps = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in body.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.checked_sub(1).ok_or_else(|| ConfigError::InvalidSelector {
                    selector: selector.to_string(),
                    reason: "unbalanced ']'".to_string(),
                })?;
                current.push(c);
            }
            '/' if depth == 0 => {
                push_step(&mut steps, &mut current, selector)?;
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(ConfigError::InvalidSelector {
            selector: selector.to_string(),
            reason: "unbalanced '['".to_string(),
        });
    }
    push_step(&mut steps, &mut current, selector)?;
    Ok(steps)
}

fn push_step(steps: &mut Vec<String>, current: &mut String, selector: &str) -> Result<(), ConfigError> {
    let step = current.trim();
    if step.is_empty() {
        return Err(ConfigError::InvalidSelector {
            selector: selector.to_string(),
            reason: "empty step".to_string(),
        });
    }
    steps.push(step.to_string());
    current.clear();
    Ok(())
}

/// Split one raw step into its name test and predicate bodies.
fn split_predicates(step: &str, selector: &str) -> Result<(String, Vec<String>), ConfigError> {
    match step.find('[') {
        None => Ok((step.trim().to_string(), Vec::new())),
        Some(idx) => {
            let name = step[..idx].trim().to_string();
            let mut predicates = Vec::new();
            let mut rest = &step[idx..];
            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return Err(ConfigError::InvalidSelector {
                        selector: selector.to_string(),
                        reason: format!("unexpected text after predicate: '{rest}'"),
                    });
                }
                let mut depth = 0usize;
                let mut end = None;
                for (i, c) in rest.char_indices() {
                    match c {
                        '[' => depth += 1,
                        ']' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(i);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let end = end.ok_or_else(|| ConfigError::InvalidSelector {
                    selector: selector.to_string(),
                    reason: "unbalanced '['".to_string(),
                })?;
                predicates.push(rest[1..end].trim().to_string());
                rest = rest[end + 1..].trim_start();
            }
            Ok((name, predicates))
        }
    }
}

fn compile_predicate(
    body: &str,
    selector: &str,
    namespaces: &BTreeMap<String, String>,
    evaluators: &ExpressionEvaluatorFactory,
) -> Result<Predicate, ConfigError> {
    if let Ok(position) = body.parse::<usize>() {
        if position == 0 {
            return Err(ConfigError::InvalidSelector {
                selector: selector.to_string(),
                reason: "position predicates are 1-based".to_string(),
            });
        }
        return Ok(Predicate::Position {
            position,
            counter: None,
        });
    }

    if let Some(predicate) = parse_attribute_equals(body, selector, namespaces)? {
        return Ok(predicate);
    }

    Ok(Predicate::Expression(evaluators.create(None, body)?))
}

/// Recognize `name = literal` / `name == literal` (optional leading `@`,
/// optional quotes). Anything else is not an attribute-equals predicate.
fn parse_attribute_equals(
    body: &str,
    selector: &str,
    namespaces: &BTreeMap<String, String>,
) -> Result<Option<Predicate>, ConfigError> {
    let Some(idx) = body.find('=') else {
        return Ok(None);
    };
    // Exclude !=, =~ and pick apart == vs =.
    if idx > 0 && body.as_bytes()[idx - 1] == b'!' {
        return Ok(None);
    }
    let after = &body[idx + 1..];
    let (value_part, _double) = match after.strip_prefix('=') {
        Some(rest) => (rest, true),
        None => {
            if after.starts_with('~') {
                return Ok(None);
            }
            (after, false)
        }
    };

    let name_part = body[..idx].trim();
    let name_part = name_part.strip_prefix('@').unwrap_or(name_part);
    if name_part.is_empty()
        || !name_part
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':')
    {
        return Ok(None);
    }

    let value = value_part.trim();
    let value = if (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        || (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
    {
        &value[1..value.len() - 1]
    } else {
        value
    };

    Ok(Some(Predicate::AttributeEquals {
        name: QName::parse(name_part, selector, namespaces)?,
        value: value.to_string(),
    }))
}
