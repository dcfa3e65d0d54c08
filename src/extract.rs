//! Zip-slip safe extraction of a verified update package.
//!
//! Extraction is two-phase: an integrity + path validation pre-pass over every
//! entry, and only then the writes. A rejected archive never leaves a single
//! file behind in the target directory.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::UpdateError;

/// Longest accepted normalized entry name, in characters.
pub const MAX_ENTRY_NAME: usize = 260;
/// Longest accepted single path component, in bytes.
pub const MAX_COMPONENT: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zip,
    TarGz,
}

fn sniff(path: &Path) -> Result<Format, UpdateError> {
    let mut magic = [0u8; 4];
    let mut f = File::open(path).map_err(|e| UpdateError::from_io(path, e))?;
    let n = f.read(&mut magic).map_err(|e| UpdateError::from_io(path, e))?;
    match &magic[..n] {
        [b'P', b'K', 3, 4] | [b'P', b'K', 5, 6] => Ok(Format::Zip),
        [0x1f, 0x8b, ..] => Ok(Format::TarGz),
        _ => Err(UpdateError::ArchiveCorrupt(format!(
            "unrecognized package format: {}",
            path.display()
        ))),
    }
}

fn reject(entry: &str, reason: &'static str) -> UpdateError {
    UpdateError::PathTraversal {
        entry: entry.to_string(),
        reason,
    }
}

/// Normalize a stored entry name into a relative path with only normal
/// components. `Ok(None)` means the entry names the archive root itself.
pub fn sanitize_entry_path(raw: &str) -> Result<Option<PathBuf>, UpdateError> {
    if raw.contains('\0') {
        return Err(reject(raw, "contains a NUL byte"));
    }
    let norm = raw.replace('\\', "/");
    if norm.starts_with('/') {
        return Err(reject(raw, "is absolute"));
    }
    let b = norm.as_bytes();
    if b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':' {
        return Err(reject(raw, "has a drive letter"));
    }
    let parts: Vec<&str> = norm
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if parts.iter().any(|c| *c == "..") {
        return Err(reject(raw, "has a parent-directory segment"));
    }
    if parts.iter().any(|c| c.contains(':')) {
        return Err(reject(raw, "has a drive or stream marker"));
    }
    if parts.iter().any(|c| c.len() > MAX_COMPONENT) {
        return Err(reject(raw, "has an over-long path component"));
    }
    let joined = parts.join("/");
    if joined.chars().count() > MAX_ENTRY_NAME {
        return Err(reject(raw, "has an over-long name"));
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.iter().collect()))
}

/// Resolve `rel` under `root` and insist the result is a strict descendant.
fn resolve_under(root: &Path, rel: &Path, raw: &str) -> Result<PathBuf, UpdateError> {
    let dest = root.join(rel);
    if dest == root || !dest.starts_with(root) {
        return Err(reject(raw, "resolves outside the extraction root"));
    }
    Ok(dest)
}

struct Planned {
    index: usize,
    rel: PathBuf,
    is_dir: bool,
    mode: Option<u32>,
}

/// Extract `archive` into `target` and return the extraction root.
///
/// # Errors
/// - `ArchiveCorrupt` when the format is unknown or the integrity pass fails.
/// - `PathTraversal` when any entry is absolute, climbs with `..`, carries a
///   drive/UNC marker, is over-long, or (tar) is a link or special file.
pub fn extract(archive: &Path, target: &Path) -> Result<PathBuf, UpdateError> {
    let format = sniff(archive)?;
    info!(?format, archive = %archive.display(), "extracting update package");
    match format {
        Format::Zip => extract_zip(archive, target)?,
        Format::TarGz => extract_tar_gz(archive, target)?,
    }
    Ok(target.to_path_buf())
}

fn open_zip(archive: &Path) -> Result<zip::ZipArchive<File>, UpdateError> {
    let f = File::open(archive).map_err(|e| UpdateError::from_io(archive, e))?;
    Ok(zip::ZipArchive::new(f)?)
}

fn extract_zip(archive: &Path, target: &Path) -> Result<(), UpdateError> {
    let mut zip = open_zip(archive)?;

    // integrity: decompress every entry, which checks its CRC
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        io::copy(&mut entry, &mut io::sink()).map_err(|e| {
            UpdateError::ArchiveCorrupt(format!("entry {:?}: {}", entry.name(), e))
        })?;
    }

    let mut plan = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let raw = entry.name().to_string();
        let Some(rel) = sanitize_entry_path(&raw)? else {
            continue;
        };
        resolve_under(target, &rel, &raw)?;
        plan.push(Planned {
            index: i,
            rel,
            is_dir: entry.is_dir(),
            mode: entry.unix_mode(),
        });
    }
    debug!(entries = plan.len(), "zip validated");

    fs::create_dir_all(target).map_err(|e| UpdateError::from_io(target, e))?;
    for p in plan {
        let dest = target.join(&p.rel);
        if p.is_dir {
            fs::create_dir_all(&dest).map_err(|e| UpdateError::from_io(&dest, e))?;
            continue;
        }
        let mut entry = zip.by_index(p.index)?;
        write_entry(&mut entry, &dest, p.mode)?;
    }
    Ok(())
}

fn open_tar(archive: &Path) -> Result<tar::Archive<GzDecoder<File>>, UpdateError> {
    let f = File::open(archive).map_err(|e| UpdateError::from_io(archive, e))?;
    Ok(tar::Archive::new(GzDecoder::new(f)))
}

fn corrupt(e: io::Error) -> UpdateError {
    UpdateError::ArchiveCorrupt(e.to_string())
}

/// Which tar entries get materialized; links and device nodes are refused.
fn tar_kind(raw: &str, et: tar::EntryType) -> Result<Option<bool>, UpdateError> {
    if et.is_pax_global_extensions()
        || et.is_pax_local_extensions()
        || et.is_gnu_longname()
        || et.is_gnu_longlink()
    {
        return Ok(None);
    }
    if et.is_dir() {
        return Ok(Some(true));
    }
    if et.is_file() || et.is_contiguous() {
        return Ok(Some(false));
    }
    if et.is_symlink() || et.is_hard_link() {
        return Err(reject(raw, "is a link"));
    }
    Err(reject(raw, "is a special file"))
}

fn extract_tar_gz(archive: &Path, target: &Path) -> Result<(), UpdateError> {
    let mut plan = Vec::new();
    {
        let mut ar = open_tar(archive)?;
        for (i, entry) in ar.entries().map_err(corrupt)?.enumerate() {
            let mut entry = entry.map_err(corrupt)?;
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let kind = tar_kind(&raw, entry.header().entry_type())?;
            io::copy(&mut entry, &mut io::sink()).map_err(corrupt)?;
            let Some(is_dir) = kind else {
                continue;
            };
            let Some(rel) = sanitize_entry_path(&raw)? else {
                continue;
            };
            resolve_under(target, &rel, &raw)?;
            plan.push(Planned {
                index: i,
                rel,
                is_dir,
                mode: entry.header().mode().ok(),
            });
        }
    }
    debug!(entries = plan.len(), "tar.gz validated");

    fs::create_dir_all(target).map_err(|e| UpdateError::from_io(target, e))?;
    let mut ar = open_tar(archive)?;
    let mut plan = plan.into_iter().peekable();
    for (i, entry) in ar.entries().map_err(corrupt)?.enumerate() {
        let Some(p) = plan.next_if(|p| p.index == i) else {
            continue;
        };
        let mut entry = entry.map_err(corrupt)?;
        let dest = target.join(&p.rel);
        if p.is_dir {
            fs::create_dir_all(&dest).map_err(|e| UpdateError::from_io(&dest, e))?;
        } else {
            write_entry(&mut entry, &dest, p.mode)?;
        }
    }
    Ok(())
}

fn write_entry(src: &mut dyn Read, dest: &Path, mode: Option<u32>) -> Result<(), UpdateError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| UpdateError::from_io(parent, e))?;
    }
    let mut out = File::create(dest).map_err(|e| UpdateError::from_io(dest, e))?;
    io::copy(src, &mut out).map_err(|e| UpdateError::from_io(dest, e))?;
    apply_mode(dest, mode);
    Ok(())
}

#[cfg(unix)]
fn apply_mode(dest: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(m) = mode {
        let _ = fs::set_permissions(dest, fs::Permissions::from_mode(m & 0o777));
    }
}

#[cfg(not(unix))]
fn apply_mode(_dest: &Path, _mode: Option<u32>) {}
