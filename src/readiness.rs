/// Banner ComfyUI prints once its HTTP listener is bound.
pub const READY_BANNER: &str = "To see the GUI go to: http://";

/// Whether a single output line signals that the server is ready.
///
/// Exact, case-sensitive prefix match on the raw line.
pub fn is_ready_line(line: &str) -> bool {
    line.starts_with(READY_BANNER)
}
