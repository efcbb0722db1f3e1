//! Shared utility functions for CLI commands

use indexmap::IndexMap;

use crate::error::{CliError, Result};

/// Format a byte size as a human-readable string
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Truncate a hash for display, keeping any `sha256:` prefix
#[must_use]
pub fn truncate_hash(hash: &str, max_len: usize) -> &str {
    let end = hash.len().min(max_len);
    hash.get(..end).unwrap_or(hash)
}

/// Parse repeated `FROM=TO` flags, later entries winning
pub fn parse_key_values(pairs: &[String]) -> Result<IndexMap<String, String>> {
    let mut map = IndexMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
            .ok_or_else(|| {
                CliError::configuration_with_help(
                    format!("invalid override '{}'", pair),
                    "use the form FROM=TO, e.g. docker.io=mirror.local",
                )
            })?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5242880), "5.00 MB");
        assert_eq!(format_size(1073741824), "1.00 GB");
    }

    #[test]
    fn test_truncate_hash() {
        let hash = "abcdef1234567890abcdef1234567890";
        assert_eq!(truncate_hash(hash, 8), "abcdef12");
        assert_eq!(truncate_hash("abc", 16), "abc");
        assert_eq!(truncate_hash("", 16), "");
    }

    #[test]
    fn test_parse_key_values() {
        let pairs = vec![
            "docker.io=mirror.local".to_string(),
            "ghcr.io = cache.local".to_string(),
            "docker.io=other.local".to_string(),
        ];
        let map = parse_key_values(&pairs).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["docker.io"], "other.local");
        assert_eq!(map["ghcr.io"], "cache.local");
    }

    #[test]
    fn test_parse_key_values_rejects_malformed() {
        for bad in ["docker.io", "=mirror", "docker.io="] {
            let err = parse_key_values(&[bad.to_string()]).unwrap_err();
            assert_eq!(err.exit_code(), crate::exit_codes::CONFIGURATION_ERROR);
        }
    }
}
