//! Collector configuration.

use thiserror::Error;

/// Default nursery size per thread (one semispace).
pub const DEFAULT_NURSERY_SIZE: usize = 4 * 1024 * 1024;
/// Default full-run period: every tenth run also collects gen2.
pub const DEFAULT_GEN2_RATIO: u32 = 10;
/// Default number of slots per routed batch.
pub const DEFAULT_PASS_WORK_SIZE: usize = 64;
/// Default number of slots per gen2 page.
pub const DEFAULT_GEN2_PAGE_ITEMS: usize = 256;

/// Tunables for one [`Instance`](crate::Instance).
///
/// # Examples
///
/// ```
/// use vmgc::GcConfig;
///
/// let config = GcConfig::default()
///     .with_nursery_size(256 * 1024)
///     .with_gen2_ratio(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Bytes per nursery semispace.
    pub nursery_size: usize,
    /// A run whose sequence number is a multiple of this is a full run.
    pub gen2_ratio: u32,
    /// Routed slots per batch before it is pushed to the target.
    pub pass_work_size: usize,
    /// Slots per gen2 page.
    pub gen2_page_items: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            nursery_size: DEFAULT_NURSERY_SIZE,
            gen2_ratio: DEFAULT_GEN2_RATIO,
            pass_work_size: DEFAULT_PASS_WORK_SIZE,
            gen2_page_items: DEFAULT_GEN2_PAGE_ITEMS,
        }
    }
}

impl GcConfig {
    /// Sets the nursery semispace size.
    #[must_use]
    pub const fn with_nursery_size(mut self, bytes: usize) -> Self {
        self.nursery_size = bytes;
        self
    }

    /// Sets the full-run period.
    #[must_use]
    pub const fn with_gen2_ratio(mut self, ratio: u32) -> Self {
        self.gen2_ratio = ratio;
        self
    }

    /// Sets the routed batch size.
    #[must_use]
    pub const fn with_pass_work_size(mut self, slots: usize) -> Self {
        self.pass_work_size = slots;
        self
    }

    /// Sets the slots per gen2 page.
    #[must_use]
    pub const fn with_gen2_page_items(mut self, items: usize) -> Self {
        self.gen2_page_items = items;
        self
    }

    /// Checks the configuration for values the collector cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page = sys_alloc::page_size();
        if self.nursery_size < page {
            return Err(ConfigError::NurseryTooSmall(self.nursery_size, page));
        }
        if self.gen2_ratio == 0 {
            return Err(ConfigError::ZeroGen2Ratio);
        }
        if self.pass_work_size == 0 {
            return Err(ConfigError::ZeroPassWorkSize);
        }
        if self.gen2_page_items == 0 {
            return Err(ConfigError::ZeroPageItems);
        }
        Ok(())
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The nursery does not hold a single OS page.
    #[error("nursery size {0} is smaller than the page size {1}")]
    NurseryTooSmall(usize, usize),
    /// A zero full-run period.
    #[error("gen2 ratio must be non-zero")]
    ZeroGen2Ratio,
    /// A zero routed batch size.
    #[error("pass work size must be non-zero")]
    ZeroPassWorkSize,
    /// A zero gen2 page capacity.
    #[error("gen2 page items must be non-zero")]
    ZeroPageItems,
}
