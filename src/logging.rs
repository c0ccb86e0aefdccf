//! Structured logging with timestamps and source locations.
//!
//! Provides the [`gwlog!`] macro for consistent log output in the format:
//!
//! ```text
//! 20260830T09:12:45.000 - src/dispatch.rs:88 - dispatch: pushed 3 notification(s)
//! ```
//!
//! Log lines go to stderr by default.  Call [`set_writer`] to redirect output
//! to any [`std::io::Write`] implementor (file, in-memory buffer, etc.).
//!
//! Session identities and device tokens are long opaque strings; use
//! [`session_tag`] and [`token_tag`] to log a short, stable prefix instead of
//! the full value.  Key material must never reach this module.

use std::io::{self, Write};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Replace the log writer.  All subsequent [`gwlog!`] output goes to `w`.
pub fn set_writer(w: Box<dyn Write + Send>) {
    *LOG_WRITER.lock().unwrap() = w;
}

const TAG_TRUNCATE_LEN: usize = 8;

fn truncate_tag(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(TAG_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Short loggable form of a session identity, e.g. `s-05c4f21a`.
pub fn session_tag(session_id: &str) -> String {
    format!("s-{}", truncate_tag(session_id))
}

/// Short loggable form of a device token, e.g. `t-9f2b11aa`.
pub fn token_tag(token: &str) -> String {
    format!("t-{}", truncate_tag(token))
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y, m, d, hours, minutes, seconds, millis
    )
}

/// Write a single log line to the current writer.
///
/// Called by the [`gwlog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{ts} - {file}:{line} - {msg}");
}

/// Emit a log line with timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// gwlog!("fetch: {} message(s) for {}", count, logging::session_tag(&id));
/// ```
#[macro_export]
macro_rules! gwlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_identities() {
        let id = "05c4f21ad4e0ff129e31ab2c";
        assert_eq!(session_tag(id), "s-05c4f21a");
        assert_eq!(token_tag("ab"), "t-ab");
    }

    #[test]
    fn timestamp_has_expected_shape() {
        let ts = format_timestamp();
        assert_eq!(ts.len(), "YYYYMMDDTHH:MM:SS.mmm".len());
        assert_eq!(&ts[8..9], "T");
    }
}
