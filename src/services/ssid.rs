//! Matching of reported network names against the device's access point.
//!
//! Names are compared after stripping surrounding quotes and whitespace and
//! lowercasing. Besides equality, either name containing the other counts as a
//! match, since some devices advertise suffixed names (`AGO-1F2E`). Two
//! unrelated networks sharing a short common substring therefore match too.

fn normalize(name: &str) -> String {
    name.trim_matches('"').trim().to_lowercase()
}

/// Whether `current` denotes the `target` access point. An empty name never matches.
pub fn matches(current: &str, target: &str) -> bool {
    let current = normalize(current);
    let target = normalize(target);

    if current.is_empty() || target.is_empty() {
        return false;
    }

    current == target || current.contains(&target) || target.contains(&current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_name_matches_itself() {
        for name in ["AGO", "Home WiFi", "ago-5G", "x"] {
            assert!(matches(&format!("\"{name}\""), name), "{name}");
        }
    }

    #[test]
    fn empty_names_never_match() {
        assert!(!matches("", "AGO"));
        assert!(!matches("AGO", ""));
        assert!(!matches("\"\"", "AGO"));
        assert!(!matches("   ", "AGO"));
        assert!(!matches("", ""));
    }

    #[test]
    fn case_insensitive() {
        assert!(matches("ago", "AGO"));
        assert!(matches("  Ago ", "aGo"));
    }

    #[test]
    fn substring_in_both_directions() {
        assert!(matches("AGO-1F2E", "AGO"));
        assert!(matches("AGO", "AGO-1F2E"));
        assert!(!matches("HomeWiFi", "AGO"));
    }
}
