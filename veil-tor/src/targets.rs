//! Target list handling

use std::collections::HashSet;
use std::path::Path;

/// Normalize one target line.
///
/// Blank lines and `#` comments yield `None`; bare hosts such as
/// `abc...xyz.onion` get an `http://` scheme.
pub fn normalize_target(raw: &str) -> Option<String> {
    let target = raw.trim();
    if target.is_empty() || target.starts_with('#') {
        return None;
    }

    if target.contains("://") {
        Some(target.to_string())
    } else {
        Some(format!("http://{}", target))
    }
}

/// Normalize and deduplicate targets, keeping first-seen order
pub fn normalize_targets<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|t| normalize_target(t.as_ref()))
        .filter(|t| seen.insert(t.trim_end_matches('/').to_lowercase()))
        .collect()
}

/// Read a target file, one URL per line
pub fn load_targets<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(normalize_targets(content.lines()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_target() {
        assert_eq!(
            normalize_target("  abcdefg.onion "),
            Some("http://abcdefg.onion".to_string())
        );
        assert_eq!(
            normalize_target("https://market.example/"),
            Some("https://market.example/".to_string())
        );
        assert_eq!(normalize_target("# disabled"), None);
        assert_eq!(normalize_target("   "), None);
    }

    #[test]
    fn test_normalize_targets_dedupes() {
        let targets = normalize_targets([
            "abacus.onion",
            "http://abacus.onion/",
            "",
            "https://vice.example",
        ]);
        assert_eq!(targets, vec!["http://abacus.onion", "https://vice.example"]);
    }
}
