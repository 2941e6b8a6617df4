//! Log hint engine: regex probes over a log tail that map common failure
//! signatures to actionable suggestions. Output is advisory; the probes run
//! case-insensitively over arbitrary tails and may false-positive on large
//! logs, so absence of a hint is never an error.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Maximum log tail the hint endpoint inspects.
pub const HINT_TAIL_BYTES: u64 = 512 * 1024;

/// One matched hint.
#[derive(Debug, Clone, Serialize)]
pub struct Hint {
    pub id: &'static str,
    pub title: &'static str,
    pub detail: &'static str,
    pub suggestion: &'static str,
}

struct Probe {
    id: &'static str,
    pattern: Regex,
    title: &'static str,
    detail: &'static str,
    suggestion: &'static str,
}

fn probe(
    id: &'static str,
    pattern: &str,
    title: &'static str,
    detail: &'static str,
    suggestion: &'static str,
) -> Probe {
    Probe {
        id,
        pattern: Regex::new(&format!("(?i){pattern}")).expect("static regex"),
        title,
        detail,
        suggestion,
    }
}

static PROBES: LazyLock<Vec<Probe>> = LazyLock::new(|| {
    vec![
        probe(
            "loop-device",
            r"failed to setup loop device|loop device",
            "Loop device not available",
            "Build container cannot mount system.img via loop device",
            "Run with privileged/rootful docker or enable loop devices in the container runtime",
        ),
        probe(
            "git-identity",
            r"Committer identity unknown|unable to auto-detect email address",
            "Git identity is not configured",
            "Git requires user.name and user.email to apply patches",
            "Set git config user.name and user.email inside the build environment",
        ),
        probe(
            "pkg-config-missing",
            r"Could NOT find PkgConfig|PKG_CONFIG_EXECUTABLE",
            "pkg-config is missing",
            "Build needs pkg-config but it is not installed",
            "Install pkg-config (pkgconf) in the build image",
        ),
        probe(
            "fmt-missing",
            r"fmtConfig\.cmake|fmt-config\.cmake",
            "fmt library is missing",
            "CMake cannot find the fmt package",
            "Install libfmt-dev (or use bundled fmt) in the build image",
        ),
        probe(
            "patch-failed",
            r"patch does not apply|patch failed",
            "Patch does not apply",
            "Source files differ from the expected base",
            "Update sources to the matching version or adjust the patch",
        ),
        probe(
            "samloader-400",
            r"DownloadBinaryInform returned 400",
            "Firmware version not found",
            "Samsung firmware server rejected the requested version",
            "Double-check model/CSC/firmware version or remove the override",
        ),
    ]
});

/// Run all probes over a log tail.
pub fn detect_build_hints(log_tail: &str) -> Vec<Hint> {
    PROBES
        .iter()
        .filter(|probe| probe.pattern.is_match(log_tail))
        .map(|probe| Hint {
            id: probe.id,
            title: probe.title,
            detail: probe.detail,
            suggestion: probe.suggestion,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_are_case_insensitive() {
        let hints = detect_build_hints("ERROR: FAILED TO SETUP LOOP DEVICE on /dev/loop0");
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].id, "loop-device");
    }

    #[test]
    fn multiple_probes_can_fire() {
        let tail = "patch does not apply\nCommitter identity unknown\n";
        let ids: Vec<&str> = detect_build_hints(tail).iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["git-identity", "patch-failed"]);
    }

    #[test]
    fn clean_log_yields_nothing() {
        assert!(detect_build_hints("everything went fine").is_empty());
    }
}
