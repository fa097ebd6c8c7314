// Local filesystem helpers: dirent copies, gzipped file maps, permissions, and relpath matching.
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub const OPEN_FILE_MODE: u32 = 0o666;
pub const OPEN_DIR_MODE: u32 = 0o777;

pub fn gzip_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("Failed to write gzip data")?;
    encoder.finish().context("Failed to finish gzip stream")
}

pub fn gunzip_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .context("Failed to decompress gzip data")?;
    Ok(output)
}

/// Write a map of `relpath -> gzipped contents` under `dir`, creating parents as needed.
pub fn gzip_bytes_to_directory(dir: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    for (relpath, gzipped) in files {
        if !is_local_relpath(relpath) {
            bail!("Refusing to write file outside of its base dir: '{}'", relpath);
        }

        let path = dir.join(relpath);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir '{}'", parent.display()))?;
        }

        let contents = gunzip_bytes(gzipped).with_context(|| format!("Bad gzip contents for '{}'", relpath))?;
        fs::write(&path, contents).with_context(|| format!("Failed to write '{}'", path.display()))?;
    }

    Ok(())
}

/// Every regular file under `dir`, keyed by its POSIX relpath, gzipped.
pub fn directory_to_gzip_map(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();

    for relpath in list_relpaths(dir)? {
        let path = dir.join(&relpath);
        let contents = fs::read(&path).with_context(|| format!("Failed to read '{}'", path.display()))?;
        files.insert(relpath, gzip_bytes(&contents)?);
    }

    Ok(files)
}

/// Sorted POSIX relpaths of every regular file under `dir`.
pub fn list_relpaths(dir: &Path) -> Result<Vec<String>> {
    let mut relpaths = Vec::new();

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk dir '{}'", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relpath = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("Path '{}' is not under '{}'", entry.path().display(), dir.display()))?;
        relpaths.push(to_posix(relpath));
    }

    relpaths.sort();
    Ok(relpaths)
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative, non-empty, and never climbs above its base once normalized.
pub fn is_local_relpath(relpath: &str) -> bool {
    let path = Path::new(relpath);
    if relpath.is_empty() || path.is_absolute() {
        return false;
    }

    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }

    true
}

/// Lexically normalize a path: drop `.` components and fold `..` where possible.
pub fn clean_path(path: &str) -> String {
    let is_abs = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !is_abs {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (is_abs, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join `path` onto `base` unless it is already absolute.
pub fn join_if_not_abs(path: &str, base: &Path) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else if path.is_empty() {
        base.to_path_buf()
    } else {
        base.join(candidate)
    }
}

pub fn remove_dirent(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat '{}'", path.display())),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove dir '{}'", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("Failed to remove file '{}'", path.display()))
    }
}

/// Copy a file, dir, or symlink.
/// When `dest` is an existing dir the source is placed inside it under its own name.
pub fn copy_dirent(source: &Path, dest: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(source)
        .with_context(|| format!("Source dirent for copy does not exist: '{}'", source.display()))?;

    let dest = if dest.is_dir() {
        match source.file_name() {
            Some(name) => dest.join(name),
            None => bail!("Cannot copy source without a file name: '{}'", source.display()),
        }
    } else {
        dest.to_path_buf()
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create dir '{}'", parent.display()))?;
    }

    if metadata.file_type().is_symlink() {
        copy_link(source, &dest)
    } else if metadata.is_dir() {
        if dest.exists() {
            bail!("Destination of whole directory copy ('{}') already exists", dest.display());
        }
        copy_dir_contents(source, &dest)
    } else {
        fs::copy(source, &dest)
            .map(|_| ())
            .with_context(|| format!("Failed to copy '{}' to '{}'", source.display(), dest.display()))
    }
}

#[cfg(unix)]
fn copy_link(source: &Path, dest: &Path) -> Result<()> {
    let target = fs::read_link(source).with_context(|| format!("Failed to read link '{}'", source.display()))?;
    std::os::unix::fs::symlink(&target, dest).with_context(|| {
        format!(
            "Failed to write link (target: '{}', source: '{}', dest: '{}')",
            target.display(),
            source.display(),
            dest.display()
        )
    })
}

#[cfg(not(unix))]
fn copy_link(source: &Path, dest: &Path) -> Result<()> {
    fs::copy(source, dest)
        .map(|_| ())
        .with_context(|| format!("Failed to copy link '{}' to '{}'", source.display(), dest.display()))
}

/// Copy the entries of `source` into `dest` (created if missing).
pub fn copy_dir_contents(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        bail!("Source of directory copy ('{}') does not exist or is not a dir", source.display());
    }

    fs::create_dir_all(dest).with_context(|| format!("Failed to create dest dir '{}'", dest.display()))?;

    let entries = fs::read_dir(source).with_context(|| format!("Could not list dir for copy '{}'", source.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Could not list dir for copy '{}'", source.display()))?;
        let target = dest.join(entry.file_name());
        if target.is_dir() && entry.path().is_dir() {
            copy_dir_contents(&entry.path(), &target)?;
        } else {
            copy_dirent(&entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Open up permissions on a tree so container users with a different UID can read and write it.
#[cfg(unix)]
pub fn recursive_chmod(base: &Path, file_mode: u32, dir_mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut errors = Vec::new();
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.push(e.to_string());
                continue;
            }
        };

        if entry.file_type().is_symlink() {
            continue;
        }

        let mode = if entry.file_type().is_dir() { dir_mode } else { file_mode };
        if let Err(e) = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode)) {
            errors.push(format!("Failed to change mode of '{}': '{}'", entry.path().display(), e));
        }
    }

    if !errors.is_empty() {
        bail!("{}", errors.join("; "));
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn recursive_chmod(_base: &Path, _file_mode: u32, _dir_mode: u32) -> Result<()> {
    Ok(())
}

/// Pair up files by relpath across two trees.
/// Returns the sorted common relpaths and one `[a, b]` row per file present on only one side
/// (the missing side is the empty string).
pub fn match_files(dir_a: &Path, dir_b: &Path) -> Result<(Vec<String>, Vec<[String; 2]>)> {
    let a: BTreeSet<String> = list_relpaths(dir_a)?.into_iter().collect();
    let b: BTreeSet<String> = list_relpaths(dir_b)?.into_iter().collect();

    let matched = a.intersection(&b).cloned().collect();

    let mut unmatched: Vec<[String; 2]> = a
        .difference(&b)
        .map(|relpath| [relpath.clone(), String::new()])
        .chain(b.difference(&a).map(|relpath| [String::new(), relpath.clone()]))
        .collect();
    unmatched.sort();

    Ok((matched, unmatched))
}
