// Win32 backends. Everything here talks to the OS through the `windows`
// crate; the rest of the crate only sees the traits.

mod ddc;
mod display;
mod input;
mod overlay;
mod shell;

pub use ddc::Win32DisplayControl;
pub use display::Win32Directory;
pub use input::Win32Activity;
pub use overlay::Win32Overlays;
pub use shell::{enable_dpi_awareness, InstanceGuard, ShellHooks, UiThread};

use crate::geometry::Rect;
use windows::Win32::Foundation::RECT;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// UTF-16 buffer up to the first NUL.
fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

fn rect_from(r: RECT) -> Rect {
    Rect::new(r.left, r.top, r.right, r.bottom)
}
