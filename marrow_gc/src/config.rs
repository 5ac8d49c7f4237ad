//! Heap configuration parameters.
//!
//! The object heap rounds every request up to an allocation granule, the
//! same way a size-class allocator would. The rounded figure is what the
//! rest of the system treats as the "allocated footprint" of an object.

use thiserror::Error;

/// Configuration for the object heap.
///
/// # Example
///
/// ```ignore
/// use marrow_gc::HeapConfig;
///
/// let config = HeapConfig {
///     granule: 32,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    // =========================================================================
    // Size Classes
    // =========================================================================
    /// Allocation granule in bytes.
    ///
    /// Every object body is rounded up to a multiple of this value. Must be
    /// a power of two and at least the pointer width.
    ///
    /// Default: 16
    pub granule: usize,

    /// Largest object body the heap will hand out.
    ///
    /// Requests above this limit fail with [`HeapError::TooLarge`](crate::HeapError::TooLarge).
    ///
    /// Default: 64MB
    pub max_object_size: usize,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Overwrite released blocks with [`POISON_BYTE`] before returning them
    /// to the system allocator.
    ///
    /// Default: false (enabled in debug builds)
    pub poison_on_free: bool,

    /// Emit a `tracing` event for every allocation and release.
    ///
    /// Default: false
    pub trace: bool,
}

/// Byte pattern written over released blocks when poisoning is enabled.
pub const POISON_BYTE: u8 = 0xDD;

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            granule: 16,
            max_object_size: 64 * 1024 * 1024,
            poison_on_free: cfg!(debug_assertions),
            trace: false,
        }
    }
}

impl HeapConfig {
    /// Configuration with the tightest rounding the heap supports.
    pub fn compact() -> Self {
        Self {
            granule: 8,
            ..Default::default()
        }
    }

    /// Configuration for debugging lifetime bugs.
    pub fn debug() -> Self {
        Self {
            poison_on_free: true,
            trace: true,
            ..Default::default()
        }
    }

    /// Round `size` up to the configured granule.
    #[inline]
    pub fn round(&self, size: usize) -> usize {
        let size = size.max(1);
        (size + self.granule - 1) & !(self.granule - 1)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.granule.is_power_of_two() {
            return Err(ConfigError::GranuleNotPowerOfTwo(self.granule));
        }
        if self.granule < size_of::<usize>() {
            return Err(ConfigError::GranuleTooSmall(self.granule));
        }
        if self.max_object_size < self.granule {
            return Err(ConfigError::MaxSizeTooSmall);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Granule must be a power of two.
    #[error("allocation granule {0} is not a power of two")]
    GranuleNotPowerOfTwo(usize),
    /// Granule must hold at least one pointer.
    #[error("allocation granule {0} is smaller than a pointer")]
    GranuleTooSmall(usize),
    /// Maximum object size must be at least one granule.
    #[error("maximum object size must be at least one granule")]
    MaxSizeTooSmall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(HeapConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(HeapConfig::compact().validate().is_ok());
        assert!(HeapConfig::debug().validate().is_ok());
    }

    #[test]
    fn test_invalid_granule() {
        let config = HeapConfig {
            granule: 24,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::GranuleNotPowerOfTwo(24))
        );

        let config = HeapConfig {
            granule: 4,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::GranuleTooSmall(4)));
    }

    #[test]
    fn test_round() {
        let config = HeapConfig::default();
        assert_eq!(config.round(0), 16);
        assert_eq!(config.round(16), 16);
        assert_eq!(config.round(17), 32);
        assert_eq!(config.round(41), 48);
    }
}
