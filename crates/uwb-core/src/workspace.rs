//! Build-tree discovery and shell-style configuration reading.
//!
//! The ROM build tree can be bind-mounted at different points depending on
//! how the containers are assembled, so the root is probed by sentinel paths
//! rather than configured directly. All functions here are pure over the
//! filesystem snapshot.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::ServiceConfig;

/// Defaults resolved from the build tree for one target codename.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TargetDefaults {
    pub source_firmware: String,
    pub target_firmware: String,
    pub version_major: i64,
    pub version_minor: i64,
    pub version_patch: i64,
    pub version_suffix: String,
}

/// A selectable target with its display name from `config.sh`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TargetOption {
    pub code: String,
    pub name: String,
}

/// Probe the candidate roots and return the first that looks like a build
/// tree (has `target/` and `unica/configs/version.sh`).
pub fn resolve_workspace_root(config: &ServiceConfig) -> Option<PathBuf> {
    let candidates = [
        config.workspace_root.clone(),
        PathBuf::from("/workspace/UN1CA"),
        PathBuf::from("/workspace"),
    ];
    candidates.into_iter().find(|root| {
        root.join("target").is_dir() && root.join("unica/configs/version.sh").is_file()
    })
}

/// Read a simple `VAR=value` / `VAR="value"` assignment from a shell file
/// without sourcing it. Returns the trimmed value of the first match.
pub fn read_shell_var(path: &Path, name: &str) -> Option<String> {
    let body = std::fs::read_to_string(path).ok()?;
    let pattern = Regex::new(&format!(
        r#"^\s*{}\s*=\s*"?([^"\n#]+)"?"#,
        regex::escape(name)
    ))
    .ok()?;
    for line in body.lines() {
        if let Some(captures) = pattern.captures(line.trim()) {
            let value = captures[1].trim().to_string();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Sorted list of target codenames (subdirectories of `target/`).
pub fn target_codenames(root: &Path) -> Vec<String> {
    let target_root = root.join("target");
    let Ok(entries) = std::fs::read_dir(&target_root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Targets with display names (`TARGET_NAME` from each `config.sh`).
pub fn target_options(root: &Path) -> Vec<TargetOption> {
    target_codenames(root)
        .into_iter()
        .map(|code| {
            let name = read_shell_var(&root.join("target").join(&code).join("config.sh"), "TARGET_NAME")
                .unwrap_or_else(|| code.clone());
            TargetOption { code, name }
        })
        .collect()
}

/// Read source/target firmware and the version triple from the three known
/// shell files.
pub fn defaults_for_target(root: &Path, target: &str) -> TargetDefaults {
    let configs = root.join("unica/configs");
    let version_sh = configs.join("version.sh");
    let read_version = |name: &str| {
        read_shell_var(&version_sh, name)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    };

    TargetDefaults {
        source_firmware: read_shell_var(&configs.join("essi.sh"), "SOURCE_FIRMWARE")
            .unwrap_or_default(),
        target_firmware: read_shell_var(
            &root.join("target").join(target).join("config.sh"),
            "TARGET_FIRMWARE",
        )
        .unwrap_or_default(),
        version_major: read_version("VERSION_MAJOR"),
        version_minor: read_version("VERSION_MINOR"),
        version_patch: read_version("VERSION_PATCH"),
        version_suffix: String::new(),
    }
}

/// Split a `MODEL/CSC/VERSION` firmware value into its model and CSC parts.
pub fn parse_model_csc(firmware_value: &str) -> (String, String) {
    let mut parts = firmware_value.split('/');
    let model = parts.next().unwrap_or("").trim().to_string();
    let csc = parts.next().unwrap_or("").trim().to_string();
    (model, csc)
}

/// `MODEL/CSC/...` -> `MODEL_CSC` cache key, uppercased. Empty when the
/// value has fewer than two components.
pub fn firmware_key_from_value(firmware_value: &str) -> String {
    let (model, csc) = parse_model_csc(firmware_value);
    if model.is_empty() || csc.is_empty() {
        return String::new();
    }
    format!("{}_{}", model.to_uppercase(), csc.to_uppercase())
}

static SAFE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("static regex"));

/// Strip anything outside `[A-Za-z0-9_-]`; used for log file names.
pub fn safe_name(value: &str) -> String {
    SAFE_NAME.replace_all(value, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("target/b0s")).unwrap();
        fs::create_dir_all(root.join("target/dm3q")).unwrap();
        fs::create_dir_all(root.join("unica/configs")).unwrap();
        fs::write(
            root.join("unica/configs/version.sh"),
            "VERSION_MAJOR=4\nVERSION_MINOR=1\nVERSION_PATCH=0\n",
        )
        .unwrap();
        fs::write(
            root.join("unica/configs/essi.sh"),
            "SOURCE_FIRMWARE=\"SM-S901B/EUX/S901BXXU9FYA1\"\n",
        )
        .unwrap();
        fs::write(
            root.join("target/b0s/config.sh"),
            "TARGET_NAME=\"Galaxy S22\"\nTARGET_FIRMWARE=SM-S901B/EUX/S901BXXU9FYA1\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn reads_quoted_and_bare_vars() {
        let dir = fake_tree();
        let config = dir.path().join("target/b0s/config.sh");
        assert_eq!(
            read_shell_var(&config, "TARGET_NAME").as_deref(),
            Some("Galaxy S22")
        );
        assert_eq!(
            read_shell_var(&config, "TARGET_FIRMWARE").as_deref(),
            Some("SM-S901B/EUX/S901BXXU9FYA1")
        );
        assert!(read_shell_var(&config, "MISSING").is_none());
    }

    #[test]
    fn lists_targets_sorted() {
        let dir = fake_tree();
        assert_eq!(target_codenames(dir.path()), vec!["b0s", "dm3q"]);
    }

    #[test]
    fn defaults_come_from_known_files() {
        let dir = fake_tree();
        let defaults = defaults_for_target(dir.path(), "b0s");
        assert_eq!(defaults.source_firmware, "SM-S901B/EUX/S901BXXU9FYA1");
        assert_eq!(defaults.version_major, 4);
        assert_eq!(defaults.version_minor, 1);
        assert_eq!(defaults.version_patch, 0);
        assert_eq!(defaults.version_suffix, "");
    }

    #[test]
    fn firmware_key_normalizes_case() {
        assert_eq!(
            firmware_key_from_value("sm-s901b/eux/S901BXXU9FYA1"),
            "SM-S901B_EUX"
        );
        assert_eq!(firmware_key_from_value("SM-S901B"), "");
        assert_eq!(firmware_key_from_value(""), "");
    }

    #[test]
    fn safe_name_strips_path_separators() {
        assert_eq!(safe_name("b0s"), "b0s");
        assert_eq!(safe_name("../etc/passwd"), "etcpasswd");
    }

    #[test]
    fn target_options_fall_back_to_codename() {
        let dir = fake_tree();
        let options = target_options(dir.path());
        assert_eq!(options[0].code, "b0s");
        assert_eq!(options[0].name, "Galaxy S22");
        assert_eq!(options[1].name, "dm3q");
    }
}
