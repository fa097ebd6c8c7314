// Copy/move operations on relative paths inside a base directory.
use crate::error::AutograderError;
use crate::fsutil::{self, clean_path, is_local_relpath};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Serialized as a JSON list: `["cp", "src", "dest"]`.
/// The verbs `cp`/`copy` and `mv`/`move` are accepted (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    Copy { source: String, dest: String },
    Move { source: String, dest: String },
}

impl FileOperation {
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Result<Self> {
        let Some((command, args)) = parts.split_first() else {
            return Err(AutograderError::validation("File operation is empty").into());
        };

        let command = command.as_ref().trim().to_lowercase();
        let is_copy = match command.as_str() {
            "cp" | "copy" => true,
            "mv" | "move" => false,
            _ => {
                return Err(
                    AutograderError::validation(format!("Unknown file operation: '{}'", command)).into(),
                )
            }
        };

        if args.len() != 2 {
            return Err(AutograderError::validation(format!(
                "Incorrect number of arguments for '{}' file operation. Expected 2, found {}",
                command,
                args.len()
            ))
            .into());
        }

        let source = clean_op_path(1, args[0].as_ref())?;
        let dest = clean_op_path(2, args[1].as_ref())?;

        Ok(if is_copy {
            FileOperation::Copy { source, dest }
        } else {
            FileOperation::Move { source, dest }
        })
    }

    pub fn copy(source: &str, dest: &str) -> Result<Self> {
        Self::from_parts(&["copy", source, dest])
    }

    pub fn move_op(source: &str, dest: &str) -> Result<Self> {
        Self::from_parts(&["move", source, dest])
    }

    pub fn validate(&self) -> Result<()> {
        Self::from_parts(&self.to_parts()).map(|_| ())
    }

    pub fn to_parts(&self) -> Vec<String> {
        match self {
            FileOperation::Copy { source, dest } => vec!["copy".to_string(), source.clone(), dest.clone()],
            FileOperation::Move { source, dest } => vec!["move".to_string(), source.clone(), dest.clone()],
        }
    }

    /// Render as a shell command with paths resolved against `base_dir` (POSIX joins).
    pub fn to_unix(&self, base_dir: &str) -> String {
        let resolve = |path: &str| shell_quote(&posix_join(base_dir, path));

        match self {
            FileOperation::Copy { source, dest } => format!("cp -r {} {}", resolve(source), resolve(dest)),
            FileOperation::Move { source, dest } => format!("mv {} {}", resolve(source), resolve(dest)),
        }
    }

    pub fn exec(&self, base_dir: &Path) -> Result<()> {
        match self {
            FileOperation::Copy { source, dest } => {
                fsutil::copy_dirent(&base_dir.join(source), &base_dir.join(dest))
            }
            FileOperation::Move { source, dest } => {
                let source = base_dir.join(source);
                let dest = resolve_move_dest(&source, &base_dir.join(dest));
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create dir '{}'", parent.display()))?;
                }
                fs::rename(&source, &dest)
                    .with_context(|| format!("Failed to move '{}' to '{}'", source.display(), dest.display()))
            }
        }
    }
}

fn resolve_move_dest(source: &Path, dest: &Path) -> PathBuf {
    match source.file_name() {
        Some(name) if dest.is_dir() => dest.join(name),
        _ => dest.to_path_buf(),
    }
}

fn clean_op_path(index: usize, raw: &str) -> Result<String> {
    if raw.contains('\\') {
        return Err(AutograderError::validation(format!(
            "Argument at index {} ('{}') contains a backslash ('\\') or is not a POSIX path",
            index, raw
        ))
        .into());
    }

    let path = clean_path(raw.trim());

    if path.starts_with('/') {
        return Err(AutograderError::validation(format!(
            "Argument at index {} ('{}') is an absolute path. Only relative paths are allowed",
            index, raw
        ))
        .into());
    }

    if path == "." {
        return Err(AutograderError::validation(format!(
            "Argument at index {} ('{}') cannot point just to the current directory",
            index, raw
        ))
        .into());
    }

    if !is_local_relpath(&path) {
        return Err(AutograderError::validation(format!(
            "Argument at index {} ('{}') points outside of its base directory",
            index, raw
        ))
        .into());
    }

    Ok(path)
}

fn posix_join(base: &str, path: &str) -> String {
    if path.starts_with('/') || base.is_empty() {
        return path.to_string();
    }

    clean_path(&format!("{}/{}", base, path))
}

/// Single-quote a word for POSIX shells.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r#"'"'"'"#))
}

pub fn exec_file_operations(operations: &[FileOperation], base_dir: &Path) -> Result<()> {
    for operation in operations {
        operation
            .exec(base_dir)
            .with_context(|| format!("Failed to exec file operation '{}'", operation))?;
    }

    Ok(())
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_parts().join(" "))
    }
}

impl Serialize for FileOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_parts().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileOperation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let parts = Vec::<String>::deserialize(deserializer)?;
        FileOperation::from_parts(&parts).map_err(serde::de::Error::custom)
    }
}
