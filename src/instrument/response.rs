//! Reply decoding.
//!
//! Instruments answer with short ASCII tokens. Numbers may carry a sign and
//! exponent (`+1.23450000E+01`), status words arrive as decimal floats, and
//! the vendor raw monitor query answers with a comma-delimited record that
//! is still wrapped in its byte-string notation (`b'12.3,0.0,0'`).

/// Parse a single numeric token.
pub fn parse_number(reply: &str) -> Option<f64> {
    reply.trim().parse::<f64>().ok()
}

/// Parse a status register reply into its integer bitmask.
///
/// Rejects negative, fractional or out-of-range values rather than
/// truncating them.
pub fn parse_status(reply: &str) -> Option<u32> {
    let value = parse_number(reply)?;
    let valid = value.is_finite()
        && value >= 0.0
        && value.fract() == 0.0
        && value <= f64::from(u32::MAX);
    valid.then_some(value as u32)
}

/// Decode a raw monitor record to its first numeric field.
pub fn parse_monitor_record(reply: &str) -> Option<f64> {
    let mut body = reply.trim();
    if let Some(rest) = body.strip_prefix('b') {
        body = rest;
    }
    let body = body.trim_matches(|c| c == '\'' || c == '"');
    let body = body.trim_end_matches("\\n").trim_end_matches("\\r");
    body.split(',').next().and_then(parse_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_with_exponent() {
        assert_eq!(parse_number("+1.23450000E+01\n"), Some(12.345));
        assert_eq!(parse_number(" -0.5 "), Some(-0.5));
        assert_eq!(parse_number("ERR"), None);
    }

    #[test]
    fn status_words() {
        assert_eq!(parse_status("+8.70400000E+03"), Some(8704));
        assert_eq!(parse_status("512"), Some(512));
        assert_eq!(parse_status("+0"), Some(0));
        assert_eq!(parse_status("12.5"), None);
        assert_eq!(parse_status("-1"), None);
        assert_eq!(parse_status("NaN"), None);
    }

    #[test]
    fn monitor_records() {
        assert_eq!(parse_monitor_record("b'12.3456,0.001,0'"), Some(12.3456));
        assert_eq!(parse_monitor_record("b'1.5,2\\n'"), Some(1.5));
        assert_eq!(parse_monitor_record("4.25,1,1"), Some(4.25));
        assert_eq!(parse_monitor_record("b''"), None);
        assert_eq!(parse_monitor_record("b'x,1'"), None);
    }
}
