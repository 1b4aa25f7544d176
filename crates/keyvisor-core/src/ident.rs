// Keyvisor Device Identification
// by-id name heuristic for keyboard event interfaces

use regex::Regex;
use std::sync::OnceLock;

fn event_kbd_rx() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| Regex::new(r"^.*-event-kbd$").unwrap())
}

fn input_if_rx() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| Regex::new(r"^.*-if[0-9]+-event-kbd$").unwrap())
}

/// Decide whether a `/dev/input/by-id` file name denotes a keyboard's
/// primary event interface.
///
/// Keyboard devices in by-id have names ending in `-event-kbd`, but
/// composite USB devices expose extra interfaces with names ending in
/// `-if<N>-event-kbd`. Only the primary interface carries the canonical
/// keystroke stream; the extras would double-handle keys if opened.
pub fn by_id_is_keyboard(name: &str) -> bool {
    event_kbd_rx().is_match(name) && !input_if_rx().is_match(name)
}
