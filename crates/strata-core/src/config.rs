//! # Operator Configuration
//!
//! Construction-time settings for a window-based operator: the window
//! policy, the partition layout of its slices, which origins feed each input
//! and what happens to late records.
//!
//! ```rust
//! use strata_core::buffer::OriginId;
//! use strata_core::config::{LateDataConfig, WindowOperatorConfig, WindowType};
//!
//! let config = WindowOperatorConfig::builder()
//!     .window(WindowType::sliding(10_000, 5_000))
//!     .left_origins([OriginId::new(1), OriginId::new(2)])
//!     .output_origin(OriginId::new(100))
//!     .late_data(LateDataConfig::with_side_output("late".to_string()))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.window.size_ms(), 10_000);
//! assert_eq!(config.num_partitions, None);
//! ```

use std::time::Duration;

use fxhash::FxHashSet;

use crate::buffer::OriginId;
use crate::operator::OperatorError;

/// Window policy of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// Fixed-size, non-overlapping windows.
    Tumbling {
        /// Window size in milliseconds
        size_ms: i64,
    },
    /// Fixed-size windows starting every `slide_ms`.
    Sliding {
        /// Window size in milliseconds
        size_ms: i64,
        /// Distance between window starts in milliseconds
        slide_ms: i64,
    },
}

impl WindowType {
    /// Tumbling windows of `size_ms`.
    #[must_use]
    pub fn tumbling(size_ms: i64) -> Self {
        Self::Tumbling { size_ms }
    }

    /// Sliding windows of `size_ms` starting every `slide_ms`.
    #[must_use]
    pub fn sliding(size_ms: i64, slide_ms: i64) -> Self {
        Self::Sliding { size_ms, slide_ms }
    }

    /// Tumbling windows of the given duration.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Duration.as_millis() fits i64 for practical values
    pub fn tumbling_duration(size: Duration) -> Self {
        Self::tumbling(size.as_millis() as i64)
    }

    /// Returns the window size in milliseconds.
    #[must_use]
    pub fn size_ms(&self) -> i64 {
        match *self {
            Self::Tumbling { size_ms } | Self::Sliding { size_ms, .. } => size_ms,
        }
    }

    /// Returns the distance between window starts in milliseconds.
    #[must_use]
    pub fn slide_ms(&self) -> i64 {
        match *self {
            Self::Tumbling { size_ms } => size_ms,
            Self::Sliding { slide_ms, .. } => slide_ms,
        }
    }

    /// Checks sizes are positive and the slide does not exceed the size.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] describing the problem.
    pub fn validate(&self) -> Result<(), OperatorError> {
        let (size, slide) = (self.size_ms(), self.slide_ms());
        if size <= 0 {
            return Err(OperatorError::InvalidConfig(format!(
                "window size must be positive, got {size}"
            )));
        }
        if slide <= 0 {
            return Err(OperatorError::InvalidConfig(format!(
                "window slide must be positive, got {slide}"
            )));
        }
        if slide > size {
            return Err(OperatorError::InvalidConfig(format!(
                "window slide {slide} exceeds window size {size}"
            )));
        }
        Ok(())
    }
}

impl Default for WindowType {
    fn default() -> Self {
        Self::Tumbling { size_ms: 1000 }
    }
}

/// Configuration for handling late data.
///
/// A record is late when every window it belongs to has already been
/// emitted. Late records never re-open a window.
///
/// # Example
///
/// ```rust
/// use strata_core::config::LateDataConfig;
///
/// // Route late records to a side output called "late_events"
/// let config = LateDataConfig::with_side_output("late_events".to_string());
/// assert_eq!(config.side_output(), Some("late_events"));
///
/// // Drop late records (default behavior)
/// let config = LateDataConfig::drop();
/// assert!(config.should_drop());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LateDataConfig {
    /// Name of the side output for late data (None = drop late records)
    side_output: Option<String>,
}

impl LateDataConfig {
    /// Creates a config that drops late records (default behavior).
    #[must_use]
    pub fn drop() -> Self {
        Self { side_output: None }
    }

    /// Creates a config that routes late records to a named side output.
    #[must_use]
    pub fn with_side_output(name: String) -> Self {
        Self {
            side_output: Some(name),
        }
    }

    /// Returns the side output name, if configured.
    #[must_use]
    pub fn side_output(&self) -> Option<&str> {
        self.side_output.as_deref()
    }

    /// Returns true if late records should be dropped.
    #[must_use]
    pub fn should_drop(&self) -> bool {
        self.side_output.is_none()
    }
}

/// Configuration of one window-based operator instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WindowOperatorConfig {
    /// Window policy.
    pub window: WindowType,
    /// Partitions per slice. `None` uses the pipeline's worker count.
    pub num_partitions: Option<usize>,
    /// Origin id stamped on emitted buffers.
    pub output_origin: OriginId,
    /// Origins feeding the left (or only) input.
    pub left_origins: Vec<OriginId>,
    /// Origins feeding the right input of a join.
    pub right_origins: Vec<OriginId>,
    /// Late record policy.
    pub late_data: LateDataConfig,
}

impl WindowOperatorConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> WindowOperatorConfigBuilder {
        WindowOperatorConfigBuilder::default()
    }

    /// Checks the configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] if the window policy is
    /// invalid, the partition count is zero, the left input has no origins,
    /// or an origin is listed twice.
    pub fn validate(&self) -> Result<(), OperatorError> {
        self.window.validate()?;
        if self.num_partitions == Some(0) {
            return Err(OperatorError::InvalidConfig(
                "number of partitions must be positive".to_string(),
            ));
        }
        if self.left_origins.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "at least one input origin is required".to_string(),
            ));
        }
        let mut seen = FxHashSet::default();
        for origin in self.left_origins.iter().chain(&self.right_origins) {
            if !seen.insert(*origin) {
                return Err(OperatorError::InvalidConfig(format!(
                    "{origin} is listed more than once"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`WindowOperatorConfig`].
#[derive(Debug, Default)]
pub struct WindowOperatorConfigBuilder {
    config: WindowOperatorConfig,
}

impl WindowOperatorConfigBuilder {
    /// Sets the window policy.
    #[must_use]
    pub fn window(mut self, window: WindowType) -> Self {
        self.config.window = window;
        self
    }

    /// Fixes the number of partitions per slice.
    #[must_use]
    pub fn num_partitions(mut self, partitions: usize) -> Self {
        self.config.num_partitions = Some(partitions);
        self
    }

    /// Sets the origin id of emitted buffers.
    #[must_use]
    pub fn output_origin(mut self, origin: OriginId) -> Self {
        self.config.output_origin = origin;
        self
    }

    /// Sets the origins of the left (or only) input.
    #[must_use]
    pub fn left_origins(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        self.config.left_origins = origins.into_iter().collect();
        self
    }

    /// Sets the origins of the right input.
    #[must_use]
    pub fn right_origins(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        self.config.right_origins = origins.into_iter().collect();
        self
    }

    /// Sets the late record policy.
    #[must_use]
    pub fn late_data(mut self, late_data: LateDataConfig) -> Self {
        self.config.late_data = late_data;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// See [`WindowOperatorConfig::validate`].
    pub fn build(self) -> Result<WindowOperatorConfig, OperatorError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
