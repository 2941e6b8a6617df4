//! Floating-feature handling: a flat key/value view over Samsung's
//! `floating_feature.xml` plus the customize-list merge that produces the
//! per-target default set.
//!
//! The XML is deliberately parsed line-wise by pattern; the service only ever
//! needs the flat `SEC_FLOATING_FEATURE_*` entries and must tolerate the
//! slightly malformed headers the stock files ship with.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

static FF_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SEC_FLOATING_FEATURE_[A-Z0-9_]+$").expect("static regex"));
static FF_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(SEC_FLOATING_FEATURE_[A-Z0-9_]+)>(.*?)</(SEC_FLOATING_FEATURE_[A-Z0-9_]+)>")
        .expect("static regex")
});
static FF_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(SEC_FLOATING_FEATURE_[A-Z0-9_]+)\s*=\s*(.*?)\s*$").expect("static regex")
});
static VAR_EXPANSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// True when `key` is a well-formed floating-feature key.
pub fn is_ff_key(key: &str) -> bool {
    FF_KEY.is_match(key)
}

/// Parse a `floating_feature.xml` into an ordered flat map. Missing or empty
/// files yield an empty map.
pub fn parse_floating_feature_xml(path: &Path) -> IndexMap<String, String> {
    let Ok(body) = std::fs::read_to_string(path) else {
        return IndexMap::new();
    };
    let mut entries = IndexMap::new();
    for captures in FF_TAG.captures_iter(&body) {
        if captures[1] == captures[3] {
            entries.insert(captures[1].to_string(), captures[2].trim().to_string());
        }
    }
    entries
}

/// Write the flat map back out in the stock file shape.
pub fn write_floating_feature_xml(
    path: &Path,
    entries: &IndexMap<String, String>,
) -> std::io::Result<()> {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<SecFloatingFeatureSet>\n");
    for (key, value) in entries {
        if is_ff_key(key) {
            out.push_str(&format!("    <{key}>{value}</{key}>\n"));
        }
    }
    out.push_str("</SecFloatingFeatureSet>\n");
    std::fs::write(path, out)
}

/// Parse `SEC_FLOATING_FEATURE_*=value` assignments from a shell file.
pub fn parse_shell_assignments(path: &Path) -> IndexMap<String, String> {
    let Ok(body) = std::fs::read_to_string(path) else {
        return IndexMap::new();
    };
    let mut entries = IndexMap::new();
    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(captures) = FF_ASSIGN.captures(line) {
            let value = captures[2].trim().trim_matches('"').trim_matches('\'').to_string();
            entries.insert(captures[1].to_string(), value);
        }
    }
    entries
}

/// Generic `KEY=value` shell variable parse (used for fallback expansion).
pub fn parse_shell_vars(path: &Path) -> HashMap<String, String> {
    let Ok(body) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let mut out = HashMap::new();
    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                out.insert(
                    key.to_string(),
                    value.trim().trim_matches('"').trim_matches('\'').to_string(),
                );
            }
        }
    }
    out
}

/// Extract the line list of a multi-line `VAR="..."` block from
/// `customize.sh`.
pub fn parse_block_from_customize(path: &Path, var_name: &str) -> Vec<String> {
    let Ok(body) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let pattern = match Regex::new(&format!(r#"(?s){}="(.*?)""#, regex::escape(var_name))) {
        Ok(p) => p,
        Err(_) => return Vec::new(),
    };
    pattern
        .captures(&body)
        .map(|captures| {
            captures[1]
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// DEPRECATED and BLACKLIST key sets from `customize.sh`.
#[derive(Debug, Default)]
pub struct CustomizeLists {
    pub deprecated: HashSet<String>,
    pub blacklist: HashSet<String>,
}

pub fn parse_customize_lists(customize_path: &Path) -> CustomizeLists {
    CustomizeLists {
        deprecated: parse_block_from_customize(customize_path, "DEPRECATED")
            .into_iter()
            .collect(),
        blacklist: parse_block_from_customize(customize_path, "BLACKLIST")
            .into_iter()
            .collect(),
    }
}

/// Expand `${VAR}` and `${VAR//needle/replacement}` against `variables`.
fn expand_fallback_value(value: &str, variables: &HashMap<String, String>) -> String {
    if !value.contains("${") {
        return value.to_string();
    }
    VAR_EXPANSION
        .replace_all(value, |captures: &regex::Captures<'_>| {
            let raw = &captures[1];
            if let Some((var, rest)) = raw.split_once("//") {
                let (needle, replacement) = rest.split_once('/').unwrap_or((rest, ""));
                variables
                    .get(var)
                    .map(|current| current.replace(needle, replacement))
                    .unwrap_or_default()
            } else {
                variables.get(raw).cloned().unwrap_or_default()
            }
        })
        .into_owned()
}

/// FALLBACK block entries of `customize.sh`, with `${...}` expansion applied.
pub fn parse_fallback_overrides(
    customize_path: &Path,
    variables: &HashMap<String, String>,
) -> IndexMap<String, String> {
    let mut entries = IndexMap::new();
    for line in parse_block_from_customize(customize_path, "FALLBACK") {
        if let Some(captures) = FF_ASSIGN.captures(&line) {
            let value = captures[2].trim().trim_matches('"').trim_matches('\'');
            entries.insert(
                captures[1].to_string(),
                expand_fallback_value(value, variables),
            );
        }
    }
    entries
}

/// Merge source and target feature maps the way the ROM scripts do:
/// blacklisted keys keep the source value, source keys take the target (or
/// fallback) value when one exists, and target-only keys survive unless
/// deprecated.
pub fn merge_floating_features(
    source: &IndexMap<String, String>,
    target: &IndexMap<String, String>,
    lists: &CustomizeLists,
    fallback: &IndexMap<String, String>,
) -> IndexMap<String, String> {
    let mut result = IndexMap::new();

    for (key, source_value) in source {
        if lists.blacklist.contains(key) {
            result.insert(key.clone(), source_value.clone());
            continue;
        }
        let target_value = target
            .get(key)
            .filter(|v| !v.is_empty())
            .or_else(|| fallback.get(key))
            .filter(|v| !v.is_empty());
        if let Some(value) = target_value {
            result.insert(key.clone(), value.clone());
        }
    }

    for (key, target_value) in target {
        if lists.blacklist.contains(key) {
            continue;
        }
        if !source.contains_key(key) && !lists.deprecated.contains(key) {
            result.insert(key.clone(), target_value.clone());
        }
    }

    result
}

/// Compute the merged default feature map for one target. This is the
/// validation set for request overrides and the payload of `GET /ff/options`.
pub fn ff_defaults_for_target(workspace_root: &Path, target: &str) -> IndexMap<String, String> {
    let target_dir = workspace_root.join("target").join(target);
    let source = parse_shell_assignments(&workspace_root.join("unica/configs/ff.sh"));
    let target_map = parse_floating_feature_xml(&target_dir.join("floating_feature.xml"));
    let customize = target_dir.join("customize.sh");
    let lists = parse_customize_lists(&customize);
    let variables = parse_shell_vars(&target_dir.join("config.sh"));
    let fallback = parse_fallback_overrides(&customize, &variables);
    merge_floating_features(&source, &target_map, &lists, &fallback)
}

/// Normalize an override value to the string form used in the XML; booleans
/// become `TRUE`/`FALSE`.
pub fn normalize_ff_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Bool(true) => "TRUE".to_string(),
        serde_json::Value::Bool(false) => "FALSE".to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        other => other.to_string().trim().to_string(),
    }
}

/// Handle to a patched target feature file.
#[derive(Debug)]
pub struct FfPatch {
    pub patched: PathBuf,
    pub backup: PathBuf,
}

/// Apply override entries to the target's `floating_feature.xml` with a
/// backup. Empty values remove the key. Returns `None` when the file does not
/// exist.
pub fn apply_ff_overrides(
    xml_path: &Path,
    overrides: &BTreeMap<String, serde_json::Value>,
) -> std::io::Result<Option<FfPatch>> {
    if !xml_path.exists() {
        return Ok(None);
    }
    let backup = xml_path.with_file_name(format!(
        "{}.bak.unica-wb",
        xml_path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    std::fs::copy(xml_path, &backup)?;

    let mut entries = parse_floating_feature_xml(xml_path);
    for (key, raw_value) in overrides {
        if !is_ff_key(key) {
            continue;
        }
        let value = normalize_ff_value(raw_value);
        if value.is_empty() {
            entries.shift_remove(key);
        } else {
            entries.insert(key.clone(), value);
        }
    }
    write_floating_feature_xml(xml_path, &entries)?;
    Ok(Some(FfPatch {
        patched: xml_path.to_path_buf(),
        backup,
    }))
}

/// Put the original file back and drop the backup. Best effort.
pub fn restore_ff_overrides(patch: &FfPatch) {
    if patch.backup.exists() {
        if let Err(error) = std::fs::copy(&patch.backup, &patch.patched) {
            tracing::warn!(%error, "failed to restore floating_feature.xml from backup");
            return;
        }
        let _ = std::fs::remove_file(&patch.backup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const XML: &str = r#"<?xml  version="1.0" encoding="UTF-8" ?>
<SecFloatingFeatureSet>
    <SEC_FLOATING_FEATURE_AUDIO_CONFIG_DOLBY>TRUE</SEC_FLOATING_FEATURE_AUDIO_CONFIG_DOLBY>
    <SEC_FLOATING_FEATURE_CAMERA_CONFIG_ZOOM>10</SEC_FLOATING_FEATURE_CAMERA_CONFIG_ZOOM>
</SecFloatingFeatureSet>
"#;

    #[test]
    fn xml_parse_keeps_order_and_ignores_junk_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floating_feature.xml");
        fs::write(&path, XML).unwrap();

        let entries = parse_floating_feature_xml(&path);
        let keys: Vec<&String> = entries.keys().collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], "SEC_FLOATING_FEATURE_AUDIO_CONFIG_DOLBY");
        assert_eq!(
            entries.get("SEC_FLOATING_FEATURE_CAMERA_CONFIG_ZOOM").map(String::as_str),
            Some("10")
        );
    }

    #[test]
    fn merge_prefers_target_then_fallback_and_respects_lists() {
        let mut source = IndexMap::new();
        source.insert("SEC_FLOATING_FEATURE_A".to_string(), "src-a".to_string());
        source.insert("SEC_FLOATING_FEATURE_B".to_string(), "src-b".to_string());
        source.insert("SEC_FLOATING_FEATURE_C".to_string(), "src-c".to_string());

        let mut target = IndexMap::new();
        target.insert("SEC_FLOATING_FEATURE_A".to_string(), "tgt-a".to_string());
        target.insert("SEC_FLOATING_FEATURE_D".to_string(), "tgt-d".to_string());
        target.insert("SEC_FLOATING_FEATURE_E".to_string(), "tgt-e".to_string());

        let mut fallback = IndexMap::new();
        fallback.insert("SEC_FLOATING_FEATURE_B".to_string(), "fb-b".to_string());

        let lists = CustomizeLists {
            deprecated: ["SEC_FLOATING_FEATURE_E".to_string()].into(),
            blacklist: ["SEC_FLOATING_FEATURE_C".to_string()].into(),
        };

        let merged = merge_floating_features(&source, &target, &lists, &fallback);
        assert_eq!(merged.get("SEC_FLOATING_FEATURE_A").map(String::as_str), Some("tgt-a"));
        assert_eq!(merged.get("SEC_FLOATING_FEATURE_B").map(String::as_str), Some("fb-b"));
        // blacklisted keeps source value
        assert_eq!(merged.get("SEC_FLOATING_FEATURE_C").map(String::as_str), Some("src-c"));
        // target-only key survives, deprecated one does not
        assert_eq!(merged.get("SEC_FLOATING_FEATURE_D").map(String::as_str), Some("tgt-d"));
        assert!(!merged.contains_key("SEC_FLOATING_FEATURE_E"));
    }

    #[test]
    fn fallback_expansion_supports_substitution() {
        let mut vars = HashMap::new();
        vars.insert("MODEL".to_string(), "SM-S901B".to_string());
        assert_eq!(expand_fallback_value("${MODEL//-/_}", &vars), "SM_S901B");
        assert_eq!(expand_fallback_value("${MODEL}", &vars), "SM-S901B");
        assert_eq!(expand_fallback_value("${MISSING}", &vars), "");
        assert_eq!(expand_fallback_value("plain", &vars), "plain");
    }

    #[test]
    fn overrides_patch_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floating_feature.xml");
        fs::write(&path, XML).unwrap();

        let mut overrides = BTreeMap::new();
        overrides.insert(
            "SEC_FLOATING_FEATURE_AUDIO_CONFIG_DOLBY".to_string(),
            serde_json::Value::Bool(false),
        );
        overrides.insert(
            "SEC_FLOATING_FEATURE_CAMERA_CONFIG_ZOOM".to_string(),
            serde_json::Value::String(String::new()),
        );

        let patch = apply_ff_overrides(&path, &overrides).unwrap().expect("patched");
        let entries = parse_floating_feature_xml(&path);
        assert_eq!(
            entries.get("SEC_FLOATING_FEATURE_AUDIO_CONFIG_DOLBY").map(String::as_str),
            Some("FALSE")
        );
        assert!(!entries.contains_key("SEC_FLOATING_FEATURE_CAMERA_CONFIG_ZOOM"));

        restore_ff_overrides(&patch);
        assert_eq!(fs::read_to_string(&path).unwrap(), XML);
        assert!(!patch.backup.exists());
    }

    #[test]
    fn customize_blocks_parse_multiline_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("customize.sh");
        fs::write(
            &path,
            "DEPRECATED=\"\nSEC_FLOATING_FEATURE_OLD\n\"\nBLACKLIST=\"\nSEC_FLOATING_FEATURE_KEEP\n\"\n",
        )
        .unwrap();
        let lists = parse_customize_lists(&path);
        assert!(lists.deprecated.contains("SEC_FLOATING_FEATURE_OLD"));
        assert!(lists.blacklist.contains("SEC_FLOATING_FEATURE_KEEP"));
    }

    #[test]
    fn normalize_values() {
        assert_eq!(normalize_ff_value(&serde_json::Value::Bool(true)), "TRUE");
        assert_eq!(
            normalize_ff_value(&serde_json::Value::String("  10 ".into())),
            "10"
        );
        assert_eq!(normalize_ff_value(&serde_json::json!(7)), "7");
    }
}
