//! Native implementations of the monitor, brightness, overlay and activity
//! traits, plus the window-message shell the daemon runs on.

pub mod win32;
