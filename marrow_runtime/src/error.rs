//! Runtime error kinds.
//!
//! Mirrors the exception classes the object model raises. Every fallible
//! runtime primitive returns [`RtResult`].

use marrow_gc::HeapError;
use thiserror::Error;

/// Errors raised by runtime primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Operation applied to an object of the wrong type.
    #[error("TypeError: {0}")]
    Type(String),

    /// Attribute lookup or assignment failed.
    #[error("AttributeError: {0}")]
    Attribute(String),

    /// Sequence index out of range.
    #[error("IndexError: {0}")]
    Index(String),

    /// Mapping key not present.
    #[error("KeyError: {0}")]
    Key(String),

    /// Argument has the right type but an inappropriate value.
    #[error("ValueError: {0}")]
    Value(String),

    /// Arithmetic result does not fit the machine representation.
    #[error("OverflowError: {0}")]
    Overflow(String),

    /// Division or modulo by zero.
    #[error("ZeroDivisionError: {0}")]
    ZeroDivision(String),

    /// The object heap refused an allocation.
    #[error("MemoryError: {0}")]
    Memory(#[from] HeapError),
}

impl RuntimeError {
    /// Build a [`RuntimeError::Type`].
    #[inline]
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::Type(msg.into())
    }

    /// Build a [`RuntimeError::Attribute`].
    #[inline]
    pub fn attribute_error(msg: impl Into<String>) -> Self {
        Self::Attribute(msg.into())
    }

    /// Build a [`RuntimeError::Index`].
    #[inline]
    pub fn index_error(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Build a [`RuntimeError::Value`].
    #[inline]
    pub fn value_error(msg: impl Into<String>) -> Self {
        Self::Value(msg.into())
    }

    /// Short exception class name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Type(_) => "TypeError",
            Self::Attribute(_) => "AttributeError",
            Self::Index(_) => "IndexError",
            Self::Key(_) => "KeyError",
            Self::Value(_) => "ValueError",
            Self::Overflow(_) => "OverflowError",
            Self::ZeroDivision(_) => "ZeroDivisionError",
            Self::Memory(_) => "MemoryError",
        }
    }
}

/// Result type for runtime primitives.
pub type RtResult<T> = Result<T, RuntimeError>;
