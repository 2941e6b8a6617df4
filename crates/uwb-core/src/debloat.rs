//! Debloat catalog parsing and per-build override patching.
//!
//! `unica/debloat.sh` declares removal lists as multi-line
//! `<PARTITION>_DEBLOAT+="` blocks. The catalog is the validation set for
//! request overrides; during a build the file is patched in place (disabled
//! paths commented out, custom paths appended) with a backup that is restored
//! when the build finishes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

const DEBLOAT_FILE: &str = "unica/debloat.sh";
const BACKUP_FILE: &str = "unica/.debloat.sh.bak.unica-wb";
const DISABLED_MARK: &str = "# UNICA_WB_DISABLED ";

static BLOCK_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(ODM|PRODUCT|SYSTEM|SYSTEM_EXT|VENDOR)_DEBLOAT\+="\s*$"#).expect("static regex")
});

/// One removable path from the debloat catalog.
#[derive(Debug, Clone, Serialize)]
pub struct DebloatEntry {
    /// `partition:path`, the id used by request overrides.
    pub id: String,
    pub partition: String,
    pub path: String,
    /// Title of the nearest preceding `#` comment heading.
    pub section: String,
}

/// Parse the catalog from `unica/debloat.sh`. Missing file yields an empty
/// catalog.
pub fn parse_debloat_entries(workspace_root: &Path) -> Vec<DebloatEntry> {
    let Ok(body) = std::fs::read_to_string(workspace_root.join(DEBLOAT_FILE)) else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let mut section = String::from("General");
    let mut partition = String::new();
    let mut in_block = false;

    for raw in body.lines() {
        let stripped = raw.trim();

        if stripped.starts_with('#') && stripped.len() > 1 {
            let title = stripped.trim_start_matches('#').trim();
            if !title.is_empty() && !title.starts_with('-') {
                section = title.to_string();
            }
            continue;
        }

        if !in_block {
            if let Some(captures) = BLOCK_START.captures(stripped) {
                in_block = true;
                partition = captures[1].to_lowercase();
            }
            continue;
        }

        // end of a multiline debloat block
        if stripped == "\"" {
            in_block = false;
            partition.clear();
            continue;
        }

        if stripped.is_empty() || stripped.starts_with('#') || stripped.contains("$(") {
            continue;
        }

        entries.push(DebloatEntry {
            id: format!("{partition}:{stripped}"),
            partition: partition.clone(),
            path: stripped.to_string(),
            section: section.clone(),
        });
    }

    entries
}

/// Handle to a patched debloat file; restore puts the backup back.
#[derive(Debug)]
pub struct DebloatPatch {
    pub patched: PathBuf,
    pub backup: PathBuf,
}

/// Patch `unica/debloat.sh` for one build: comment out `disabled_ids`
/// (`partition:path` form) and append custom SYSTEM/PRODUCT blocks.
/// Returns `None` when there is nothing to change or no debloat file.
pub fn apply_debloat_overrides(
    workspace_root: &Path,
    disabled_ids: &[String],
    added_system_paths: &[String],
    added_product_paths: &[String],
) -> std::io::Result<Option<DebloatPatch>> {
    let added_system: Vec<&str> = added_system_paths
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    let added_product: Vec<&str> = added_product_paths
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();

    if disabled_ids.is_empty() && added_system.is_empty() && added_product.is_empty() {
        return Ok(None);
    }

    let target = workspace_root.join(DEBLOAT_FILE);
    if !target.exists() {
        return Ok(None);
    }

    let disabled_paths: HashSet<&str> = disabled_ids
        .iter()
        .filter_map(|id| id.split_once(':').map(|(_, path)| path))
        .collect();

    let backup = workspace_root.join(BACKUP_FILE);
    std::fs::copy(&target, &backup)?;

    let body = std::fs::read_to_string(&target)?;
    let mut out = String::with_capacity(body.len() + 256);
    for raw in body.lines() {
        let stripped = raw.trim();
        if disabled_paths.contains(stripped) && !stripped.starts_with('#') {
            out.push_str(DISABLED_MARK);
        }
        out.push_str(raw);
        out.push('\n');
    }

    if !added_system.is_empty() || !added_product.is_empty() {
        out.push_str("\n# UNICA_WB custom debloat entries\n");
        for (var, paths) in [("SYSTEM_DEBLOAT", &added_system), ("PRODUCT_DEBLOAT", &added_product)]
        {
            if paths.is_empty() {
                continue;
            }
            out.push_str(var);
            out.push_str("+=\"\n");
            for path in paths {
                out.push_str(path);
                out.push('\n');
            }
            out.push_str("\"\n");
        }
    }

    std::fs::write(&target, out)?;
    Ok(Some(DebloatPatch {
        patched: target,
        backup,
    }))
}

/// Put the pre-patch content back and drop the backup. Best effort: a missing
/// backup leaves the file as is.
pub fn restore_debloat_file(patch: &DebloatPatch) {
    if patch.patched.exists() && patch.backup.exists() {
        if let Err(error) = std::fs::copy(&patch.backup, &patch.patched) {
            tracing::warn!(%error, "failed to restore debloat file from backup");
            return;
        }
        let _ = std::fs::remove_file(&patch.backup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE: &str = r#"# Samsung bloat
SYSTEM_DEBLOAT+="
app/Bixby
priv-app/Facebook
"

# Carrier junk
PRODUCT_DEBLOAT+="
app/CarrierThing
$(dynamic_entry)
"
"#;

    fn tree_with_debloat() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("unica")).unwrap();
        fs::write(dir.path().join(DEBLOAT_FILE), SAMPLE).unwrap();
        dir
    }

    #[test]
    fn parses_partitions_sections_and_skips_dynamic_entries() {
        let dir = tree_with_debloat();
        let entries = parse_debloat_entries(dir.path());

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, "system:app/Bixby");
        assert_eq!(entries[0].section, "Samsung bloat");
        assert_eq!(entries[2].id, "product:app/CarrierThing");
        assert_eq!(entries[2].section, "Carrier junk");
        assert!(!entries.iter().any(|e| e.path.contains("$(")));
    }

    #[test]
    fn missing_file_gives_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        assert!(parse_debloat_entries(dir.path()).is_empty());
    }

    #[test]
    fn apply_comments_out_disabled_and_appends_custom() {
        let dir = tree_with_debloat();
        let patch = apply_debloat_overrides(
            dir.path(),
            &["system:app/Bixby".to_string()],
            &["app/Custom".to_string()],
            &[],
        )
        .unwrap()
        .expect("patch applied");

        let body = fs::read_to_string(&patch.patched).unwrap();
        assert!(body.contains("# UNICA_WB_DISABLED app/Bixby"));
        assert!(body.contains("priv-app/Facebook"));
        assert!(body.contains("# UNICA_WB custom debloat entries"));
        assert!(body.contains("app/Custom"));
        assert!(patch.backup.exists());
    }

    #[test]
    fn restore_round_trips_original_content() {
        let dir = tree_with_debloat();
        let patch = apply_debloat_overrides(
            dir.path(),
            &["product:app/CarrierThing".to_string()],
            &[],
            &[],
        )
        .unwrap()
        .expect("patch applied");

        restore_debloat_file(&patch);
        let body = fs::read_to_string(dir.path().join(DEBLOAT_FILE)).unwrap();
        assert_eq!(body, SAMPLE);
        assert!(!patch.backup.exists());
    }

    #[test]
    fn no_overrides_means_no_patch() {
        let dir = tree_with_debloat();
        assert!(apply_debloat_overrides(dir.path(), &[], &[], &[])
            .unwrap()
            .is_none());
    }
}
