//! Config validation: unknown-key detection with Levenshtein suggestions.
//!
//! Two-pass parse: first read the raw TOML into `toml::Value`, walk the key
//! tree and compare against known field names, emitting "did you mean?"
//! warnings. Then the normal serde deserialization runs. Warnings never
//! break a config.

use std::collections::HashSet;

/// A non-fatal config warning (typo, unknown section).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Complete set of valid dotted key paths for `StreamConfig`.
///
/// Must track the struct hierarchy in stream_config.rs.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [stage]
        "stage",
        "stage.kind",
        "stage.subscribe",
        // [stage.rewrite]
        "stage.rewrite",
        "stage.rewrite.match",
        "stage.rewrite.index",
        "stage.rewrite.replace",
        // [kalman]
        "kalman",
        "kalman.process_noise",
        "kalman.measurement_noise",
        "kalman.boundary",
        "kalman.output",
        // [registry]
        "registry",
        "registry.retention",
        "registry.max_streams",
        "registry.idle_secs",
        // [bridge]
        "bridge",
        "bridge.progress_every",
        // [server]
        "server",
        "server.addr",
        "server.enabled",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively collect all dotted key paths of a `toml::Value` tree.
///
/// A table `{ a = { b = 1, c = 2 } }` yields `["a", "a.b", "a.c"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Closest known key within edit distance 3. Ties resolve alphabetically.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|&k| (levenshtein(unknown, k), k))
        .filter(|&(dist, _)| dist <= 3)
        .min()
        .map(|(_, k)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Return warnings for any unknown keys in a raw TOML string.
///
/// Never fails; parse errors are reported by the serde pass.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("hello", "hello"), 0);
        assert_eq!(levenshtein("proces_noise", "process_noise"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested() {
        let toml: toml::Value = r#"
            [stage]
            kind = "detrend"
            [stage.rewrite]
            match = "raw"
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"stage".to_string()));
        assert!(keys.contains(&"stage.kind".to_string()));
        assert!(keys.contains(&"stage.rewrite".to_string()));
        assert!(keys.contains(&"stage.rewrite.match".to_string()));
    }

    #[test]
    fn test_typo_key_produces_warning_with_suggestion() {
        let warnings = validate_unknown_keys("[kalman]\nmeasurment_noise = 1e-10\n");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "kalman.measurment_noise");
        assert_eq!(
            warnings[0].suggestion.as_deref(),
            Some("kalman.measurement_noise")
        );
        assert!(warnings[0].to_string().contains("did you mean"));
    }

    #[test]
    fn test_unknown_section_without_suggestion() {
        let warnings = validate_unknown_keys("[mqtt]\nbroker = \"localhost\"\n");
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|w| w.suggestion.is_none()));
    }

    #[test]
    fn test_malformed_toml_produces_no_warnings() {
        assert!(validate_unknown_keys("[stage\nkind =").is_empty());
    }

    #[test]
    fn test_known_keys_cover_all_sections() {
        let known = known_config_keys();
        for section in ["stage", "stage.rewrite", "kalman", "registry", "bridge", "server"] {
            assert!(known.contains(section), "missing section {}", section);
        }
    }
}
