//! Uploaded mod archive validation and safe extraction.
//!
//! Accepts ZIP or TAR (plain or gzip). Every entry's resolved path must stay
//! inside the extraction root; directories are skipped and recreated from
//! file paths. After extraction the module layout is discovered: either
//! top-level directories each carrying a `module.prop`, or a single wrapping
//! directory containing such children.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use uwb_core::mods::parse_module_prop;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Unsafe archive path: {0}")]
    UnsafePath(String),

    #[error("Unsupported archive format")]
    UnsupportedFormat,

    #[error("Archive must contain modules with structure module-name/module.prop")]
    NoModuleLayout,

    #[error("No valid modules found in archive")]
    NoModules,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Corrupt archive: {0}")]
    Corrupt(String),
}

/// One module parsed out of a validated archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub module_dir: String,
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "versionCode")]
    pub version_code: String,
    pub author: String,
    pub description: String,
    pub props: BTreeMap<String, String>,
}

/// Result of archive validation.
#[derive(Debug)]
pub struct ValidatedArchive {
    /// Directory whose children are the module directories.
    pub modules_root: PathBuf,
    pub modules: Vec<ModuleManifest>,
}

/// Reject any relative path that would escape the extraction root.
fn safe_join(base: &Path, rel: &str) -> Result<PathBuf, ArchiveError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(ArchiveError::UnsafePath(rel.to_string()));
    }
    let mut out = base.to_path_buf();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(ArchiveError::UnsafePath(rel.to_string())),
        }
    }
    Ok(out)
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let target = safe_join(dest, &name)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn extract_tar_from(reader: impl Read, dest: &Path) -> Result<(), ArchiveError> {
    let mut tar = tar::Archive::new(reader);
    let entries = tar.entries().map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let target = safe_join(dest, &rel)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Extract a ZIP or TAR (plain/gzip) archive into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let mut magic = [0u8; 4];
    let read = File::open(archive)?.read(&mut magic)?;

    if read >= 4 && magic[..4] == [0x50, 0x4b, 0x03, 0x04] {
        return extract_zip(archive, dest);
    }
    if read >= 2 && magic[..2] == [0x1f, 0x8b] {
        return extract_tar_from(flate2::read::GzDecoder::new(File::open(archive)?), dest);
    }
    // Plain tar has no leading magic; try it last.
    extract_tar_from(File::open(archive)?, dest).map_err(|error| match error {
        ArchiveError::UnsafePath(p) => ArchiveError::UnsafePath(p),
        _ => ArchiveError::UnsupportedFormat,
    })
}

/// Find the directory whose children are module directories.
fn find_modules_root(extract_dir: &Path) -> Result<(PathBuf, Vec<PathBuf>), ArchiveError> {
    let module_dirs = |root: &Path| -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.join("module.prop").is_file())
            .collect();
        dirs.sort();
        dirs
    };

    let direct = module_dirs(extract_dir);
    if !direct.is_empty() {
        return Ok((extract_dir.to_path_buf(), direct));
    }

    let top_dirs: Vec<PathBuf> = std::fs::read_dir(extract_dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    if let [wrapper] = top_dirs.as_slice() {
        let nested = module_dirs(wrapper);
        if !nested.is_empty() {
            return Ok((wrapper.clone(), nested));
        }
    }

    Err(ArchiveError::NoModuleLayout)
}

/// Extract and validate an uploaded mod archive, returning the parsed module
/// manifests. At least one valid module is required.
pub fn validate_mods_archive(
    archive: &Path,
    work_dir: &Path,
) -> Result<ValidatedArchive, ArchiveError> {
    let extract_dir = work_dir.join("extract");
    std::fs::create_dir_all(&extract_dir)?;
    extract_archive(archive, &extract_dir)?;

    let (modules_root, module_dirs) = find_modules_root(&extract_dir)?;

    let mut modules = Vec::new();
    for module_dir in module_dirs {
        let dir_name = module_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let props = std::fs::read_to_string(module_dir.join("module.prop"))
            .map(|body| parse_module_prop(&body))
            .unwrap_or_default();
        let get = |key: &str| props.get(key).cloned().unwrap_or_default();
        modules.push(ModuleManifest {
            id: get("id"),
            name: props
                .get("name")
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| dir_name.clone()),
            version: get("version"),
            version_code: get("versionCode"),
            author: get("author"),
            description: get("description"),
            props,
            module_dir: dir_name,
        });
    }

    if modules.is_empty() {
        return Err(ArchiveError::NoModules);
    }

    Ok(ValidatedArchive {
        modules_root,
        modules,
    })
}
