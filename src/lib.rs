//! Per-monitor idle detection for OLED displays.
//!
//! Each managed monitor goes idle on its own once nothing has touched it for
//! its threshold, and is then covered by a black overlay or dimmed over
//! DDC/CI. Everything outside [`platform`] is OS independent and runs
//! against the traits in [`monitor`], [`brightness`], [`overlay`] and [`idle`].

pub mod brightness;
pub mod error;
pub mod geometry;
pub mod idle;
pub mod monitor;
pub mod orchestrator;
pub mod overlay;
#[cfg(windows)]
pub mod platform;
pub mod topology;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, Platform, Timing};
