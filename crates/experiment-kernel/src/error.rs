//! Error types for experiment configuration and formula evaluation.
//!
//! Agent-call failures are `anyhow::Error` and do not appear here.

use thiserror::Error;

/// Errors raised while compiling variable definitions or drawing conditions.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConditionError {
    /// The definition names a kind outside fixed/choice/uniform/sequence/derived.
    #[error("unknown variable kind '{0}'")]
    UnknownKind(String),

    /// A definition is missing a field its kind requires, or carries an invalid one.
    #[error("variable '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    /// Derived variables reference each other in a cycle.
    #[error("circular dependency among derived variables: {}", .names.join(", "))]
    CyclicDependency { names: Vec<String> },

    /// A derived formula failed to parse or evaluate.
    #[error("variable '{variable}': {source}")]
    Formula {
        variable: String,
        #[source]
        source: FormulaError,
    },
}

impl ConditionError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn formula(variable: &str, source: FormulaError) -> Self {
        Self::Formula {
            variable: variable.to_string(),
            source,
        }
    }
}

/// Errors from the restricted arithmetic evaluator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormulaError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("undefined name '{0}'")]
    UndefinedName(String),

    #[error("function '{0}' is not allowed")]
    DisallowedFunction(String),

    #[error("attribute access is not allowed ('{0}.')")]
    AttributeAccess(String),

    #[error("'{function}' expects {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: String,
        found: usize,
    },

    #[error("'{0}' is not numeric")]
    NonNumeric(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,

    #[error("result is not a finite number")]
    NonFinite,
}
