//! Epoch-second timestamps and duration helpers.
//!
//! All game timestamps are fractional seconds since the Unix epoch, carried
//! as `f64`. Cubebox-local timestamps are authoritative for cubebox events;
//! nothing in the protocol assumes the nodes' clocks agree.

use chrono::Utc;

/// A duration in seconds (fractional).
pub type Seconds = f64;

/// A point in time, in fractional seconds since the Unix epoch.
pub type Timestamp = f64;

/// Current wall-clock time as an epoch timestamp.
pub fn now() -> Timestamp {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Parse a `"h:m"` game-duration string into seconds.
///
/// `"1:30"` is one hour thirty minutes. Returns `None` on malformed input.
pub fn parse_hm(text: &str) -> Option<Seconds> {
    let (h, m) = text.split_once(':')?;
    let hours: u32 = h.trim().parse().ok()?;
    let minutes: u32 = m.trim().parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    Some(f64::from(hours * 3600 + minutes * 60))
}

/// Format a duration as `HH:MM:SS` for logs and the console.
pub fn format_hms(secs: Seconds) -> String {
    let total = secs.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
