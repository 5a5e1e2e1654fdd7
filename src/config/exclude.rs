// src/config/exclude.rs
// Path-exclusion matching rule — spec §4.1.
//
// A pattern matches a path either as a raw string or as a "key-form" in
// which path separators are normalised to dashes, mirroring how project
// paths get turned into cache/session keys elsewhere in the pipeline.
//
// The tricky part is the literal (non-wildcard) case: matching must happen
// at real path-component boundaries, not on the flattened dash string,
// or a pattern like "-home-ubuntu" would falsely match inside a directory
// literally named "ubuntu-other" (see the test below — both paths produce
// indistinguishable dash runs once flattened to a single string).

use std::path::Path;

/// Normalise a path into its dash-joined key form, e.g. `/home/ubuntu/proj`
/// becomes `-home-ubuntu-proj`.
pub fn path_to_key(path: &Path) -> String {
    path.to_string_lossy().replace(['/', '\\'], "-")
}

fn to_key(raw: &str) -> String {
    raw.replace(['/', '\\'], "-")
}

/// Whether `raw_path` is excluded by any pattern in `excluded_paths`.
pub fn is_excluded(raw_path: &str, excluded_paths: &[String]) -> bool {
    excluded_paths.iter().any(|pattern| matches(pattern, raw_path))
}

fn matches(pattern: &str, raw_path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        let key_path = to_key(raw_path);
        let key_prefix = to_key(prefix);
        return raw_path.starts_with(prefix) || key_path.contains(&key_prefix);
    }

    if raw_path == pattern {
        return true;
    }

    literal_boundary_match(pattern, raw_path)
}

/// Split both the pattern and the path into their real components (on `-`
/// for the pattern, which is already given in key-form; on `/` or `\` for
/// the path) and look for the pattern's component sequence as a contiguous,
/// exactly-aligned run within the path's components. This is what makes
/// `-home-ubuntu` match `/home/ubuntu/project` but not
/// `/home/ubuntu-other/project` — in the latter, `ubuntu-other` is a single
/// real component that the pattern's `ubuntu` token cannot partially match.
fn literal_boundary_match(pattern: &str, raw_path: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('-').collect();
    let path_tokens: Vec<&str> = raw_path.split(['/', '\\']).collect();

    if pattern_tokens.is_empty() || pattern_tokens.len() > path_tokens.len() {
        return false;
    }

    path_tokens
        .windows(pattern_tokens.len())
        .any(|window| window == pattern_tokens.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_pattern_prefix_matches_raw_path() {
        assert!(matches("/tmp/scratch*", "/tmp/scratch/foo.txt"));
    }

    #[test]
    fn wildcard_pattern_matches_key_form_substring() {
        assert!(matches("home-ubuntu*", "/home/ubuntu/project"));
    }

    #[test]
    fn literal_pattern_exact_match() {
        assert!(matches("/home/ubuntu/project", "/home/ubuntu/project"));
    }

    #[test]
    fn literal_pattern_matches_key_form_at_component_boundary() {
        assert!(matches("-home-ubuntu", "/home/ubuntu/project"));
    }

    #[test]
    fn literal_pattern_does_not_match_mid_component_substring() {
        // The spec's explicit negative case: "ubuntu-other" is one real path
        // component, so the pattern's "ubuntu" token must not partially
        // match inside it even though the flattened dash strings overlap.
        assert!(!matches("-home-ubuntu", "/home/ubuntu-other/project"));
    }

    #[test]
    fn literal_pattern_does_not_match_when_component_has_extra_suffix() {
        assert!(!matches("-home-ubuntu", "/home/ubuntu-backup"));
    }

    #[test]
    fn literal_pattern_can_match_mid_path_not_just_prefix() {
        assert!(matches("ubuntu-project", "/home/ubuntu/project/sub"));
    }

    #[test]
    fn is_excluded_checks_all_patterns() {
        let patterns = vec!["-opt-skip".to_string(), "/tmp/keep*".to_string()];
        assert!(is_excluded("/opt/skip/me", &patterns));
        assert!(is_excluded("/tmp/keep/me", &patterns));
        assert!(!is_excluded("/var/data/project", &patterns));
    }
}
