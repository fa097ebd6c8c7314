// Declarative descriptions of where a file (or tree of files) comes from.
use crate::error::AutograderError;
use crate::fsutil::{self, clean_path, is_local_relpath, join_if_not_abs};
use anyhow::{bail, Context, Result};
use globset::GlobBuilder;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSpecType {
    #[default]
    Empty,
    Nil,
    Path,
    Git,
    Url,
}

impl FileSpecType {
    fn parse(text: &str) -> Result<Self> {
        match text.trim().to_lowercase().as_str() {
            "empty" | "" => Ok(FileSpecType::Empty),
            "nil" => Ok(FileSpecType::Nil),
            "path" => Ok(FileSpecType::Path),
            "git" => Ok(FileSpecType::Git),
            "url" => Ok(FileSpecType::Url),
            other => Err(AutograderError::validation(format!("Unknown FileSpec type: '{}'", other)).into()),
        }
    }
}

impl fmt::Display for FileSpecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FileSpecType::Empty => "empty",
            FileSpecType::Nil => "nil",
            FileSpecType::Path => "path",
            FileSpecType::Git => "git",
            FileSpecType::Url => "url",
        };
        f.write_str(text)
    }
}

/// A source artifact plus a destination hint.
///
/// JSON accepts three shapes:
/// - `null` or `""`: an empty spec.
/// - a string: a URL when it starts with `http`, otherwise a (possibly glob) path.
/// - an object with `type`, `path`, `dest`, `reference`, `username`, and `token`.
///
/// Call `validate` after deserializing; it normalizes the fields and fills in default dests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileSpec {
    #[serde(rename = "type")]
    pub kind: FileSpecType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

impl FileSpec {
    pub fn empty() -> Self {
        FileSpec::default()
    }

    pub fn nil() -> Self {
        FileSpec { kind: FileSpecType::Nil, ..Default::default() }
    }

    pub fn path(path: impl Into<String>) -> Self {
        FileSpec { kind: FileSpecType::Path, path: path.into(), ..Default::default() }
    }

    pub fn path_with_dest(path: impl Into<String>, dest: impl Into<String>) -> Self {
        FileSpec { kind: FileSpecType::Path, path: path.into(), dest: dest.into(), ..Default::default() }
    }

    /// Parse the loose command-line form: a bare word is treated as a JSON string.
    pub fn parse(contents: &str) -> Result<Self> {
        let contents = contents.trim();
        let spec: FileSpec = if contents.starts_with('"') || contents.starts_with('{') {
            serde_json::from_str(contents)
        } else {
            serde_json::from_value(serde_json::Value::String(contents.to_string()))
        }
        .with_context(|| format!("Failed to parse FileSpec '{}'", contents))?;

        spec.validated(false)
    }

    pub fn is_empty(&self) -> bool {
        self.kind == FileSpecType::Empty
    }

    pub fn is_nil(&self) -> bool {
        self.kind == FileSpecType::Nil
    }

    pub fn is_path(&self) -> bool {
        self.kind == FileSpecType::Path
    }

    pub fn is_git(&self) -> bool {
        self.kind == FileSpecType::Git
    }

    pub fn is_url(&self) -> bool {
        self.kind == FileSpecType::Url
    }

    pub fn is_abs(&self) -> bool {
        self.is_path() && Path::new(&self.path).is_absolute()
    }

    pub fn validate(&self) -> Result<()> {
        self.clone().validated(false).map(|_| ())
    }

    /// Validate and return the normalized spec.
    /// With `only_local_paths`, path and dest must be relative and stay inside their base dir.
    pub fn validated(mut self, only_local_paths: bool) -> Result<Self> {
        self.path = self.path.trim().to_string();
        self.dest = self.dest.trim().to_string();
        self.reference = self.reference.trim().to_string();
        self.username = self.username.trim().to_string();
        self.token = self.token.trim().to_string();

        match self.kind {
            FileSpecType::Empty | FileSpecType::Nil => {
                if !(self.path.is_empty()
                    && self.dest.is_empty()
                    && self.reference.is_empty()
                    && self.username.is_empty()
                    && self.token.is_empty())
                {
                    return Err(invalid("An empty/nil FileSpec should have no other fields set"));
                }
            }
            FileSpecType::Path => {
                if !(self.reference.is_empty() && self.username.is_empty() && self.token.is_empty()) {
                    return Err(invalid(
                        "A path FileSpec should not have reference, username, or token fields set",
                    ));
                }

                self.path = clean_file_path(&self.path, false, only_local_paths).context("Invalid path field for FileSpec")?;

                if let Err(e) = GlobBuilder::new(&self.path).literal_separator(true).build() {
                    return Err(invalid(format!("Invalid path pattern '{}': '{}'", self.path, e)));
                }

                self.dest = clean_file_path(&self.dest, true, only_local_paths).context("Invalid dest field for FileSpec")?;
            }
            FileSpecType::Git | FileSpecType::Url => {
                if self.path.is_empty() {
                    return Err(invalid(format!("A {} FileSpec cannot have an empty path", self.kind)));
                }

                self.dest = clean_file_path(&self.dest, true, only_local_paths).context("Invalid dest field for FileSpec")?;

                if self.dest.is_empty() {
                    self.dest = url_base_name(&self.path, self.is_git())?;
                }
            }
        }

        Ok(self)
    }

    /// Where this spec lands when copied into `base_dir`.
    pub fn get_dest(&self, base_dir: &Path) -> PathBuf {
        join_if_not_abs(&self.dest, base_dir)
    }

    /// Copy a path spec (expanding globs relative to `base_dir`) into `dest_dir`.
    /// Empty and nil specs are no-ops. Git and URL specs need network access and are
    /// fetched by the caller.
    pub fn copy_local_target(&self, base_dir: &Path, dest_dir: &Path) -> Result<()> {
        match self.kind {
            FileSpecType::Empty | FileSpecType::Nil => Ok(()),
            FileSpecType::Path => self.copy_paths(base_dir, dest_dir),
            FileSpecType::Git | FileSpecType::Url => {
                bail!("FileSpec '{}' is not local and cannot be copied without fetching", self)
            }
        }
    }

    fn copy_paths(&self, base_dir: &Path, dest_dir: &Path) -> Result<()> {
        let pattern = join_if_not_abs(&self.path, base_dir);
        let paths = glob_paths(&pattern)
            .with_context(|| format!("Failed to resolve the path pattern '{}'", self.path))?;

        if paths.is_empty() {
            return Err(AutograderError::not_found(format!("No targets found for the path '{}'", self.path)).into());
        }

        let dest = self.get_dest(dest_dir);
        if paths.len() > 1 {
            if !self.dest.is_empty() && dest.is_file() {
                bail!("Found multiple paths (via glob), but dest is a file. Dest must be a dir");
            }

            fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to make destination dir '{}'", dest.display()))?;
        }

        for path in paths {
            fsutil::copy_dirent(&path, &dest)
                .with_context(|| format!("Failed to copy path '{}' to '{}'", path.display(), dest.display()))?;
        }

        Ok(())
    }
}

impl fmt::Display for FileSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak credentials into logs.
        let redacted = FileSpec {
            token: if self.token.is_empty() { String::new() } else { "<redacted>".to_string() },
            ..self.clone()
        };

        match serde_json::to_string(&redacted) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<error>"),
        }
    }
}

impl<'de> Deserialize<'de> for FileSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;

        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Null => Ok(FileSpec::empty()),
            serde_json::Value::String(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    Ok(FileSpec::empty())
                } else if text.starts_with("http") {
                    Ok(FileSpec { kind: FileSpecType::Url, path: text, ..Default::default() })
                } else {
                    Ok(FileSpec::path(text))
                }
            }
            serde_json::Value::Object(_) => {
                let mut fields: HashMap<String, String> = serde_json::from_value(value).map_err(D::Error::custom)?;
                let mut take = |key: &str| fields.remove(key).unwrap_or_default();

                let kind = FileSpecType::parse(&take("type")).map_err(D::Error::custom)?;
                Ok(FileSpec {
                    kind,
                    path: take("path"),
                    dest: take("dest"),
                    reference: take("reference"),
                    username: take("username"),
                    token: take("token"),
                })
            }
            other => Err(D::Error::custom(format!(
                "Could not deserialize FileSpec. Should be a JSON string or object, found '{}'",
                other
            ))),
        }
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    AutograderError::validation(message).into()
}

fn clean_file_path(raw: &str, allow_empty: bool, only_local: bool) -> Result<String> {
    let path = raw.trim();
    if path.is_empty() {
        if allow_empty {
            return Ok(String::new());
        }
        return Err(invalid("File path cannot be empty"));
    }

    let path = clean_path(path);

    if only_local {
        if Path::new(&path).is_absolute() {
            return Err(invalid(format!("File path '{}' is not allowed to be absolute", raw)));
        }

        if !is_local_relpath(&path) {
            return Err(invalid(format!("File path '{}' points outside of its base directory", raw)));
        }
    }

    Ok(path)
}

/// The last path segment of a URL, optionally without its extension.
pub fn url_base_name(uri: &str, remove_ext: bool) -> Result<String> {
    let without_scheme = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    let without_query = without_scheme.split(['?', '#']).next().unwrap_or_default();
    let url_path = without_query.split_once('/').map(|(_, path)| path).unwrap_or_default();

    let mut base = url_path.trim_end_matches('/').rsplit('/').next().unwrap_or_default().to_string();
    if base.is_empty() {
        return Err(invalid(format!("Could not find base name for URL: '{}'", uri)));
    }

    if remove_ext {
        if let Some(index) = base.rfind('.') {
            if index > 0 {
                base.truncate(index);
            }
        }
    }

    Ok(base)
}

fn has_glob_meta(text: &str) -> bool {
    text.contains(['*', '?', '[', '{'])
}

/// Expand a glob pattern where `*` does not cross directory separators.
/// A pattern with no glob characters matches itself if it exists.
fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>> {
    let text = pattern.to_string_lossy();
    if !has_glob_meta(&text) {
        return Ok(if fs::symlink_metadata(pattern).is_ok() { vec![pattern.to_path_buf()] } else { Vec::new() });
    }

    let mut root = PathBuf::new();
    let mut depth = 0;
    for component in pattern.components() {
        let part = component.as_os_str().to_string_lossy();
        if depth == 0 && !has_glob_meta(&part) {
            root.push(component);
        } else {
            depth += 1;
        }
    }

    let matcher = GlobBuilder::new(&text)
        .literal_separator(true)
        .build()
        .map_err(|e| invalid(format!("Invalid path pattern '{}': '{}'", text, e)))?
        .compile_matcher();

    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut matches = Vec::new();
    for entry in WalkDir::new(&root).min_depth(depth).max_depth(depth).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk '{}'", root.display()))?;
        if matcher.is_match(entry.path()) {
            matches.push(entry.path().to_path_buf());
        }
    }

    matches.sort();
    Ok(matches)
}
