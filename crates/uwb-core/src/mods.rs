//! Mod catalog (`unica/mods/*`) and per-build disable overrides.
//!
//! A mod is a directory with a `module.prop`; a `disable` marker file keeps
//! the build from applying it. Request overrides toggle those markers for the
//! duration of one build and are restored afterwards.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

const MODS_DIR: &str = "unica/mods";
const DISABLE_BACKUP: &str = ".disable.unica-wb.bak";

/// One entry of the mod catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ModEntry {
    /// Directory name; the id used by request overrides.
    pub id: String,
    pub name: String,
    pub author: String,
    pub description: String,
    pub default_disabled: bool,
}

/// Parse `module.prop` (`key=value` lines, `#` comments skipped).
pub fn parse_module_prop(body: &str) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    props
}

/// Enumerate the mod catalog, sorted case-insensitively by directory name.
pub fn parse_mod_entries(workspace_root: &Path) -> Vec<ModEntry> {
    let mods_dir = workspace_root.join(MODS_DIR);
    let Ok(read) = std::fs::read_dir(&mods_dir) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = read
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.join("module.prop").is_file())
        .collect();
    dirs.sort_by_key(|p| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    });

    dirs.into_iter()
        .map(|dir| {
            let id = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let props = std::fs::read_to_string(dir.join("module.prop"))
                .map(|body| parse_module_prop(&body))
                .unwrap_or_default();
            ModEntry {
                name: props.get("name").filter(|v| !v.is_empty()).cloned().unwrap_or_else(|| id.clone()),
                author: props.get("author").cloned().unwrap_or_default(),
                description: props.get("description").cloned().unwrap_or_default(),
                default_disabled: dir.join("disable").exists(),
                id,
            }
        })
        .collect()
}

/// Marker-file changes made for one build, undone by [`restore_mods_overrides`].
#[derive(Debug, Default)]
pub struct ModOverrideState {
    created_disable: Vec<PathBuf>,
    removed_disable_backups: Vec<(PathBuf, PathBuf)>,
}

impl ModOverrideState {
    pub fn is_empty(&self) -> bool {
        self.created_disable.is_empty() && self.removed_disable_backups.is_empty()
    }
}

/// Reconcile `disable` markers with the requested set: mods in `disabled_ids`
/// gain a marker, everything else has a pre-existing marker moved aside.
pub fn apply_mods_disabled_overrides(
    workspace_root: &Path,
    disabled_ids: &[String],
) -> Option<ModOverrideState> {
    let mods_dir = workspace_root.join(MODS_DIR);
    if !mods_dir.exists() {
        return None;
    }

    let disabled: HashSet<&str> = disabled_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();

    let mut state = ModOverrideState::default();
    let entries = parse_mod_entries(workspace_root);
    for entry in &entries {
        let mod_dir = mods_dir.join(&entry.id);
        let disable_path = mod_dir.join("disable");
        if disabled.contains(entry.id.as_str()) {
            if !disable_path.exists()
                && std::fs::write(&disable_path, "disabled by unica-wb for one build\n").is_ok()
            {
                state.created_disable.push(disable_path);
            }
            continue;
        }
        if disable_path.exists() {
            let backup_path = mod_dir.join(DISABLE_BACKUP);
            let _ = std::fs::remove_file(&backup_path);
            if std::fs::rename(&disable_path, &backup_path).is_ok() {
                state.removed_disable_backups.push((backup_path, disable_path));
            }
        }
    }

    if state.is_empty() { None } else { Some(state) }
}

/// Undo marker changes from [`apply_mods_disabled_overrides`]. Best effort.
pub fn restore_mods_overrides(state: &ModOverrideState) {
    for disable_path in &state.created_disable {
        let _ = std::fs::remove_file(disable_path);
    }
    for (backup_path, disable_path) in &state.removed_disable_backups {
        if backup_path.exists() {
            if let Err(error) = std::fs::rename(backup_path, disable_path) {
                tracing::warn!(%error, path = %disable_path.display(), "failed to restore disable marker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn mod_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, prop, disabled) in [
            ("AlphaMod", "id=alpha\nname=Alpha Mod\nauthor=dev\n", false),
            ("zeta-mod", "name=Zeta\ndescription=last one\n", true),
            ("BetaMod", "# comment only\nname=Beta\n", false),
        ] {
            let mod_dir = dir.path().join(MODS_DIR).join(name);
            fs::create_dir_all(&mod_dir).unwrap();
            fs::write(mod_dir.join("module.prop"), prop).unwrap();
            if disabled {
                fs::write(mod_dir.join("disable"), "x").unwrap();
            }
        }
        // Not a mod: no module.prop
        fs::create_dir_all(dir.path().join(MODS_DIR).join("stray")).unwrap();
        dir
    }

    #[test]
    fn module_prop_parsing_trims_and_skips_comments() {
        let props = parse_module_prop("# header\nid = alpha \nname=Alpha Mod\nbroken line\n");
        assert_eq!(props.get("id").map(String::as_str), Some("alpha"));
        assert_eq!(props.get("name").map(String::as_str), Some("Alpha Mod"));
        assert!(!props.contains_key("broken line"));
    }

    #[test]
    fn catalog_is_sorted_case_insensitively() {
        let dir = mod_tree();
        let entries = parse_mod_entries(dir.path());
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["AlphaMod", "BetaMod", "zeta-mod"]);
        assert!(entries[2].default_disabled);
        assert_eq!(entries[0].name, "Alpha Mod");
    }

    #[test]
    fn overrides_create_and_remove_markers_then_restore() {
        let dir = mod_tree();
        let mods_dir = dir.path().join(MODS_DIR);

        // Disable AlphaMod, re-enable zeta-mod for this build.
        let state =
            apply_mods_disabled_overrides(dir.path(), &["AlphaMod".to_string()]).expect("changes");
        assert!(mods_dir.join("AlphaMod/disable").exists());
        assert!(!mods_dir.join("zeta-mod/disable").exists());
        assert!(mods_dir.join("zeta-mod").join(DISABLE_BACKUP).exists());

        restore_mods_overrides(&state);
        assert!(!mods_dir.join("AlphaMod/disable").exists());
        assert!(mods_dir.join("zeta-mod/disable").exists());
    }

    #[test]
    fn matching_state_yields_no_override() {
        let dir = mod_tree();
        // zeta-mod is already disabled; asking for exactly that changes nothing.
        assert!(apply_mods_disabled_overrides(dir.path(), &["zeta-mod".to_string()]).is_none());
    }
}
