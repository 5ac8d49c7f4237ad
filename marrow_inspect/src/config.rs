//! View configuration.

use thiserror::Error;

/// How a view tracks the lifetime of the object it overlays.
///
/// # Example
///
/// ```
/// use marrow_inspect::ViewConfig;
///
/// let config = ViewConfig {
///     hold_ref: false,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewConfig {
    // =========================================================================
    // Lifetime
    // =========================================================================
    /// Keep a strong reference to the object for the life of the view.
    ///
    /// Default: true
    pub hold_ref: bool,

    /// Keep a weak reference when the object's type supports one.
    ///
    /// Default: true
    pub weak_ref: bool,

    // =========================================================================
    // Diagnostics
    // =========================================================================
    /// Emit a warning when `base()` rebuilds a reference from the raw
    /// address of an object that looks dead.
    ///
    /// Default: true
    pub warn_on_reconstruct: bool,

    // =========================================================================
    // Limits
    // =========================================================================
    /// Largest object body a swap will stage in a temporary buffer.
    ///
    /// Default: 64MB
    pub max_swap_bytes: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            hold_ref: true,
            weak_ref: true,
            warn_on_reconstruct: true,
            max_swap_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ViewConfig {
    /// Views that never keep their object alive.
    pub fn borrowed() -> Self {
        Self {
            hold_ref: false,
            ..Default::default()
        }
    }

    /// Views with no lifetime source at all; `base()` only works inside a
    /// capability scope.
    pub fn detached() -> Self {
        Self {
            hold_ref: false,
            weak_ref: false,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_swap_bytes < MIN_SWAP_BYTES {
            return Err(ConfigError::SwapLimitTooSmall(self.max_swap_bytes));
        }
        Ok(())
    }
}

/// Smallest useful swap limit: one object header.
pub const MIN_SWAP_BYTES: usize = size_of::<marrow_runtime::ObjectHeader>();

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Swap limit below one object header.
    #[error("swap limit of {0} bytes cannot hold an object header")]
    SwapLimitTooSmall(usize),
}
