//! Condition expression evaluators and their name-keyed factory.
//!
//! Conditions gate whether a resource config applies during filtering. The
//! engine is decoupled from any particular expression language: an
//! evaluator is a small capability (`evaluate(context) -> bool`) and
//! construction goes through [`ExpressionEvaluatorFactory`], keyed by
//! evaluator name. The factory ships one built-in language (`"basic"`)
//! and accepts registrations for user-supplied languages.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use regex::Regex;

use crate::error::ConfigError;

/// Variables visible to condition expressions during evaluation.
///
/// Seeded from the sentinel global-parameters resource when an execution
/// context is created; callers may add further variables before filtering.
#[derive(Debug, Default, Clone)]
pub struct ExpressionContext {
    vars: HashMap<String, String>,
}

impl ExpressionContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Look up a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// A compiled condition expression.
///
/// Implementations must be cheap to evaluate and free of interior
/// mutability: the same evaluator instance is shared across executions.
pub trait ExpressionEvaluator: Debug + Send + Sync {
    /// Evaluate the expression against the given context.
    fn evaluate(&self, context: &ExpressionContext) -> bool;

    /// The source text this evaluator was compiled from.
    fn expression(&self) -> &str;
}

type EvaluatorCtor =
    Box<dyn Fn(&str) -> Result<Arc<dyn ExpressionEvaluator>, ConfigError> + Send + Sync>;

/// Name of the default evaluator used when a `<condition>` names none.
pub const DEFAULT_EVALUATOR: &str = "basic";

/// Instantiates named condition evaluators from `(name, expression)` pairs.
///
/// The default factory knows the built-in [`DEFAULT_EVALUATOR`]. Additional
/// languages are registered by name; an unknown name surfaces as
/// [`ConfigError::EvaluatorInstantiation`] with the name attached.
pub struct ExpressionEvaluatorFactory {
    ctors: HashMap<String, EvaluatorCtor>,
}

impl Default for ExpressionEvaluatorFactory {
    fn default() -> Self {
        let mut factory = Self {
            ctors: HashMap::new(),
        };
        factory.register(DEFAULT_EVALUATOR, |expression| {
            Ok(Arc::new(BasicExpressionEvaluator::compile(expression)?) as Arc<dyn ExpressionEvaluator>)
        });
        factory
    }
}

impl ExpressionEvaluatorFactory {
    /// Create a factory with the built-in evaluator registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an evaluator constructor under a name.
    pub fn register<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&str) -> Result<Arc<dyn ExpressionEvaluator>, ConfigError> + Send + Sync + 'static,
    {
        self.ctors.insert(name.into(), Box::new(ctor));
    }

    /// Instantiate an evaluator.
    ///
    /// `evaluator` of `None` selects the default language. An empty (or
    /// whitespace-only) expression is a configuration error.
    pub fn create(
        &self,
        evaluator: Option<&str>,
        expression: &str,
    ) -> Result<Arc<dyn ExpressionEvaluator>, ConfigError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(ConfigError::EmptyConditionExpression);
        }

        let name = evaluator.unwrap_or(DEFAULT_EVALUATOR);
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| ConfigError::EvaluatorInstantiation {
                evaluator: name.to_string(),
            })?;
        ctor(expression)
    }
}

impl Debug for ExpressionEvaluatorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionEvaluatorFactory")
            .field("evaluators", &self.ctors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The built-in comparison language.
///
/// Recognized forms, over string variables from [`ExpressionContext`]:
///
/// - `name == 'literal'` / `name != 'literal'` (quotes optional)
/// - `name =~ 'regex'` (anchored nowhere; plain [`Regex::is_match`])
/// - bare `name` - truthy when the variable is set, non-empty and not
///   the literal `"false"`
/// - `true` / `false`
#[derive(Debug)]
pub struct BasicExpressionEvaluator {
    expression: String,
    op: BasicOp,
}

#[derive(Debug)]
enum BasicOp {
    Literal(bool),
    Truthy { name: String },
    Eq { name: String, value: String },
    Ne { name: String, value: String },
    Matches { name: String, pattern: Regex },
}

impl BasicExpressionEvaluator {
    /// Compile an expression.
    pub fn compile(expression: &str) -> Result<Self, ConfigError> {
        let trimmed = expression.trim();
        let op = Self::parse(trimmed).ok_or_else(|| ConfigError::InvalidExpression {
            expression: trimmed.to_string(),
            reason: "expected <name>, <name> == <value>, <name> != <value> or <name> =~ <regex>"
                .to_string(),
        })?;
        let op = match op {
            ParsedOp::Complete(op) => op,
            ParsedOp::Regex { name, pattern } => BasicOp::Matches {
                name,
                pattern: Regex::new(&pattern).map_err(|e| ConfigError::InvalidExpression {
                    expression: trimmed.to_string(),
                    reason: e.to_string(),
                })?,
            },
        };
        Ok(Self {
            expression: trimmed.to_string(),
            op,
        })
    }

    fn parse(expression: &str) -> Option<ParsedOp> {
        for (token, build) in [
            ("==", OpKind::Eq),
            ("!=", OpKind::Ne),
            ("=~", OpKind::Matches),
        ] {
            if let Some(idx) = expression.find(token) {
                let name = expression[..idx].trim();
                let value = unquote(expression[idx + token.len()..].trim());
                if name.is_empty() || !is_identifier(name) {
                    return None;
                }
                return Some(match build {
                    OpKind::Eq => ParsedOp::Complete(BasicOp::Eq {
                        name: name.to_string(),
                        value,
                    }),
                    OpKind::Ne => ParsedOp::Complete(BasicOp::Ne {
                        name: name.to_string(),
                        value,
                    }),
                    OpKind::Matches => ParsedOp::Regex {
                        name: name.to_string(),
                        pattern: value,
                    },
                });
            }
        }

        match expression {
            "true" => Some(ParsedOp::Complete(BasicOp::Literal(true))),
            "false" => Some(ParsedOp::Complete(BasicOp::Literal(false))),
            name if is_identifier(name) => Some(ParsedOp::Complete(BasicOp::Truthy {
                name: name.to_string(),
            })),
            _ => None,
        }
    }
}

enum OpKind {
    Eq,
    Ne,
    Matches,
}

enum ParsedOp {
    Complete(BasicOp),
    Regex { name: String, pattern: String },
}

impl ExpressionEvaluator for BasicExpressionEvaluator {
    fn evaluate(&self, context: &ExpressionContext) -> bool {
        match &self.op {
            BasicOp::Literal(value) => *value,
            BasicOp::Truthy { name } => context
                .get(name)
                .is_some_and(|v| !v.is_empty() && v != "false"),
            BasicOp::Eq { name, value } => context.get(name) == Some(value.as_str()),
            BasicOp::Ne { name, value } => context.get(name) != Some(value.as_str()),
            BasicOp::Matches { name, pattern } => {
                context.get(name).is_some_and(|v| pattern.is_match(v))
            }
        }
    }

    fn expression(&self) -> &str {
        &self.expression
    }
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}
