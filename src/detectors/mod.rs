//! Chart-pattern detectors
//!
//! Each detector looks at the window ending at the most recent candle and
//! returns unscored [`PatternSignal`](crate::PatternSignal)s.
//!
//! # Pattern Families
//!
//! - **Flag**: bull and bear flags (pole + consolidation)
//! - **Triangle**: ascending and descending triangles (flat side + sloping side)
//! - **Breakout**: horizontal, ascending and descending channel breakouts
//! - **Double extreme**: double tops and double bottoms

pub mod helpers;

/// Generate `with_defaults()` -> `Self::default()` for detector configs.
macro_rules! impl_with_defaults {
  ($($config:ty),* $(,)?) => {
    $(impl $config {
      pub fn with_defaults() -> Self { Self::default() }
    })*
  };
}

pub mod channel;
pub mod double;
pub mod flag;
pub mod triangle;

impl_with_defaults!(
  flag::FlagConfig,
  triangle::TriangleConfig,
  channel::ChannelConfig,
  double::DoubleConfig,
);

// Re-export all detectors for convenience
pub use channel::*;
pub use double::*;
pub use flag::*;
pub use helpers::*;
pub use triangle::*;
