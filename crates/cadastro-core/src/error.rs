use thiserror::Error;

/// Validation errors for registry keys and administrative input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("registry key cannot be empty")]
    EmptyKey,
    #[error("registry key contains invalid character '{ch}' at index {index}")]
    KeyInvalidChar { ch: char, index: usize },
    #[error("registry key must have {expected} digits, found {found}")]
    KeyWrongLength { found: usize, expected: usize },

    #[error("invalid provider '{value}', expected one of receitaws, cnpjws, cnpja_open")]
    InvalidProvider { value: String },
    #[error("status '{value}' cannot be reset, expected one of processing, error, rate_limited")]
    InvalidResetStatus { value: String },
}
