/// Progress extraction from transcoder diagnostic records.
///
/// A record such as
/// `frame= 4855 fps= 46 q=31.0 size=   45306kB time=00:02:42.28 bitrate=2287.0kbits/`
/// carries the cumulative elapsed time after the `time=` marker.
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Substring that flags a record as carrying elapsed time.
pub const PROGRESS_MARKER: &str = "time=";

static ELAPSED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d+):(\d+):(\d+\.\d+)").unwrap());

/// Decode a raw record as UTF-8, reinterpreting it as ISO-8859-1 when the
/// bytes are not valid UTF-8. Never fails.
pub fn decode_record(raw: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(raw) {
        Ok(text) => Cow::Borrowed(text),
        Err(e) => {
            tracing::trace!(error = %e, "record is not valid UTF-8, decoding as ISO-8859-1");
            Cow::Owned(raw.iter().map(|&b| char::from(b)).collect())
        }
    }
}

/// Elapsed seconds reported by a record.
///
/// Returns `None` when the record has no progress marker, and `Some(0.0)` when
/// the marker is present but the `HH:MM:SS.ss` field doesn't match.
pub fn parse_elapsed(record: &str) -> Option<f64> {
    if !record.contains(PROGRESS_MARKER) {
        return None;
    }

    let Some(caps) = ELAPSED_PATTERN.captures(record) else {
        tracing::debug!(record = %record.trim(), "unrecognized progress marker, assuming 0.0");
        return Some(0.0);
    };

    let field = |i: usize| caps[i].parse::<f64>().unwrap_or(0.0);
    Some(field(1) * 3600.0 + field(2) * 60.0 + field(3))
}

/// Normalize elapsed time against the total duration.
///
/// A non-positive or non-finite total yields `None`; the sample is skipped.
/// The result is not clamped and may slightly exceed 1.0.
pub fn progress_fraction(elapsed: f64, total_duration: f64) -> Option<f64> {
    if total_duration.is_finite() && total_duration > 0.0 {
        Some(elapsed / total_duration)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_elapsed_full_record() {
        let record = "frame= 4855 fps= 46 q=31.0 size=   45306kB time=00:02:42.28 bitrate=2287.0kbits/";
        let elapsed = parse_elapsed(record).unwrap();
        assert!((elapsed - 162.28).abs() < 1e-9);
    }

    #[test]
    fn test_parse_elapsed_hours() {
        let elapsed = parse_elapsed("time=01:02:03.50 bitrate=").unwrap();
        assert!((elapsed - 3723.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_elapsed_no_marker() {
        assert_eq!(parse_elapsed("Stream #0:0: Video: h264"), None);
        assert_eq!(parse_elapsed(""), None);
    }

    #[test]
    fn test_parse_elapsed_malformed_defaults_to_zero() {
        assert_eq!(parse_elapsed("size=   0kB time=garbage bitrate=N/A"), Some(0.0));
        assert_eq!(parse_elapsed("time=N/A"), Some(0.0));
        // Whole seconds without a fraction are not the expected shape.
        assert_eq!(parse_elapsed("time=00:00:10 bitrate="), Some(0.0));
    }

    #[test]
    fn test_progress_fraction() {
        let elapsed = parse_elapsed("time=01:02:03.50").unwrap();
        let progress = progress_fraction(elapsed, 3723.5).unwrap();
        assert!((progress - 0.99999).abs() < 1e-4);
        assert!((progress_fraction(30.0, 120.0).unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_progress_fraction_can_exceed_one() {
        let progress = progress_fraction(101.0, 100.0).unwrap();
        assert!(progress > 1.0);
    }

    #[test]
    fn test_progress_fraction_zero_duration_skipped() {
        assert_eq!(progress_fraction(12.0, 0.0), None);
        assert_eq!(progress_fraction(12.0, -5.0), None);
        assert_eq!(progress_fraction(12.0, f64::NAN), None);
        assert_eq!(progress_fraction(12.0, f64::INFINITY), None);
    }

    #[test]
    fn test_decode_valid_utf8_borrows() {
        let decoded = decode_record("frame= 1 size=".as_bytes());
        assert!(matches!(decoded, Cow::Borrowed(_)));
        assert_eq!(decoded, "frame= 1 size=");
    }

    #[test]
    fn test_decode_invalid_utf8_falls_back_to_latin1() {
        let decoded = decode_record(b"caf\xe9 time=00:00:01.00 size=");
        assert_eq!(decoded, "caf\u{e9} time=00:00:01.00 size=");
        assert_eq!(parse_elapsed(&decoded), Some(1.0));
    }
}
