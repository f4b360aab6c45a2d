//! Duration parsing for config values such as `statement_timeout`.

use std::time::Duration;

use anyhow::Context;

/// Parse a duration string like "1h", "30m", "300s", "250ms" or "300".
///
/// Plain numbers are seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    // "ms" before "m" and "s"
    if let Some(num_str) = s.strip_suffix("ms") {
        let millis: u64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid milliseconds value: {num_str}"))?;
        return Ok(Duration::from_millis(millis));
    }

    let (num_str, unit_secs) = if let Some(n) = s.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        (s, 1)
    };

    let value: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration value: {s}"))?;
    let secs = value
        .checked_mul(unit_secs)
        .with_context(|| format!("Duration out of range: {s}"))?;
    Ok(Duration::from_secs(secs))
}
