use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const WORKFLOW_DIR: &str = ".workflow";
pub const TEMPLATES_DIR: &str = ".workflow/templates";

pub const CONFIG_FILE: &str = ".workflow/config.yaml";
pub const INSTANCES_DIR: &str = ".workflow/instances";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn workflow_dir(root: &Path) -> PathBuf {
    root.join(WORKFLOW_DIR)
}

pub fn templates_dir(root: &Path) -> PathBuf {
    root.join(TEMPLATES_DIR)
}

pub fn template_path(root: &Path, id: &str) -> PathBuf {
    templates_dir(root).join(format!("{id}.yaml"))
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// One redb file per instance lives here.
pub fn instances_dir(root: &Path) -> PathBuf {
    root.join(INSTANCES_DIR)
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    SLUG_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_\-]*[a-z0-9]$|^[a-z0-9]$").expect("slug regex is valid")
    })
}

/// Template ids, phase names and action refs are lowercase slugs.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= 64 && slug_re().is_match(slug)
}

/// Gate ids are looser ("D3", "G2.5"): non-empty, no whitespace.
pub fn is_valid_gate_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && !id.chars().any(char::is_whitespace)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_slugs() {
        for slug in ["design", "a", "run-tests", "g2_5", "x1"] {
            assert!(is_valid_slug(slug), "expected valid: {slug}");
        }
    }

    #[test]
    fn invalid_slugs() {
        for slug in ["", "-design", "design-", "has spaces", "UPPER"] {
            assert!(!is_valid_slug(slug), "expected invalid: {slug}");
        }
    }

    #[test]
    fn gate_ids_allow_dots_and_case() {
        assert!(is_valid_gate_id("G2.5"));
        assert!(is_valid_gate_id("D3"));
        assert!(!is_valid_gate_id("G 2"));
        assert!(!is_valid_gate_id(""));
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.workflow/config.yaml")
        );
        assert_eq!(
            template_path(root, "delivery"),
            PathBuf::from("/tmp/proj/.workflow/templates/delivery.yaml")
        );
        assert_eq!(
            instances_dir(root),
            PathBuf::from("/tmp/proj/.workflow/instances")
        );
    }
}
