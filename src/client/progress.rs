//! Progress bar styling
// (c) 2025 Ross Younger

/// Maximum update frequency we will use for the progress display
pub(crate) const MAX_UPDATE_FPS: u8 = 20;

/// A single-line style format for Indicatif which should cover most situations.
///
/// ```text
/// 11111111111111111111111111111111111111111111111111111111111111111111111111111111
/// filename [==========================            ] 2m30s @ 123.4MB/s [70%/1.24GB]
/// 11111111111111111111111111111111111111111111111111111111111111111111111111111111
/// ```
const PROGRESS_STYLE_COMPACT: &str =
    "{msg:.dim} {wide_bar:.cyan} {eta} @ {decimal_bytes_per_sec} [{decimal_total_bytes:.dim}]";

/// Space to allow for the filename
///
/// We need about 35 characters for the data readout and maybe 20 for a
/// useful bar; this informs how much space the filename may take.
const DATA_AND_PROGRESS: usize = 55;

/// A double-line style format for Indicatif for use when the filename is too long.
const PROGRESS_STYLE_OVERLONG: &str = "{wide_msg:.dim} [{decimal_total_bytes:.dim}]\n{wide_bar:.cyan} {eta} @ {decimal_bytes_per_sec}";

/// Determine and retrieve the appropriate progress style to use
pub(crate) fn style_for(msg_size: usize) -> &'static str {
    let term_width = console::Term::stderr().size().1 as usize; // this returns a reasonable default if it can't detect
    if msg_size + DATA_AND_PROGRESS > term_width {
        PROGRESS_STYLE_OVERLONG
    } else {
        PROGRESS_STYLE_COMPACT
    }
}
