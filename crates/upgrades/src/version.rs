use semver::Version;

/// Parse a chart version.
///
/// Strict semver first; otherwise accept a leading `v` and missing minor/patch
/// components (`v1.2` => `1.2.0`), which chart repositories publish in the wild.
pub fn parse_version(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim();
    match Version::parse(trimmed) {
        Ok(v) => Ok(v),
        Err(strict_err) => normalize(trimmed).and_then(|n| Version::parse(&n).ok()).ok_or(strict_err),
    }
}

fn normalize(raw: &str) -> Option<String> {
    let s = raw.strip_prefix('v').or_else(|| raw.strip_prefix('V')).unwrap_or(raw);
    let split_at = s.find(['-', '+']).unwrap_or(s.len());
    let (core, suffix) = s.split_at(split_at);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }
    let mut padded: Vec<&str> = parts;
    while padded.len() < 3 {
        padded.push("0");
    }
    Some(format!("{}{}", padded.join("."), suffix))
}
