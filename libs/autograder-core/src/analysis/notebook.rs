// Source preparation: notebooks become plain Python before analysis.
use anyhow::{Context, Result};
use autograder_common::fsutil::list_relpaths;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const NOTEBOOK_EXTENSION: &str = "ipynb";
const PYTHON_EXTENSION: &str = "py";

#[derive(Deserialize)]
struct Notebook {
    #[serde(default)]
    cells: Vec<NotebookCell>,
}

#[derive(Deserialize)]
struct NotebookCell {
    cell_type: String,
    #[serde(default)]
    source: CellSource,
}

// nbformat allows either a single string or a list of lines.
#[derive(Deserialize)]
#[serde(untagged)]
enum CellSource {
    Text(String),
    Lines(Vec<String>),
}

impl Default for CellSource {
    fn default() -> Self {
        CellSource::Text(String::new())
    }
}

impl CellSource {
    fn text(&self) -> String {
        match self {
            CellSource::Text(text) => text.clone(),
            CellSource::Lines(lines) => lines.concat(),
        }
    }
}

/// The code cells of a notebook, in order. IPython magics and shell escapes are commented out.
pub fn extract_notebook_code(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read notebook '{}'", path.display()))?;
    let notebook: Notebook =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse notebook '{}'", path.display()))?;

    let mut cells = Vec::new();
    for cell in notebook.cells.iter().filter(|cell| cell.cell_type == "code") {
        let code = cell
            .source
            .text()
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if trimmed.starts_with('%') || trimmed.starts_with('!') {
                    format!("# {}", line)
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        cells.push(code.trim_end().to_string());
    }

    let mut code = cells.join("\n\n");
    code.push('\n');
    Ok(code)
}

/// Rewrite every notebook under `dir` into a sibling `.py` file.
/// Returns `{new relpath: old relpath}` for each rewritten file.
pub fn prep_source_files(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut renames = BTreeMap::new();

    for relpath in list_relpaths(dir)? {
        let path = dir.join(&relpath);
        let Some(new_path) = prep_source_file(&path)
            .with_context(|| format!("Failed to prepare source file '{}'", relpath))?
        else {
            continue;
        };

        let new_relpath = new_path
            .strip_prefix(dir)
            .with_context(|| format!("Prepared file '{}' escaped its dir", new_path.display()))?
            .to_string_lossy()
            .replace('\\', "/");

        renames.insert(new_relpath, relpath);
    }

    Ok(renames)
}

fn prep_source_file(path: &Path) -> Result<Option<PathBuf>> {
    let is_notebook = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(NOTEBOOK_EXTENSION));
    if !is_notebook {
        return Ok(None);
    }

    let new_path = unused_python_path(path);
    let code = extract_notebook_code(path).context("Unable to extract Python notebook code")?;

    fs::write(&new_path, code)
        .with_context(|| format!("Unable to write Python file '{}'", new_path.display()))?;
    fs::remove_file(path).with_context(|| format!("Unable to remove notebook '{}'", path.display()))?;

    debug!(from = %path.display(), to = %new_path.display(), "Rewrote notebook");
    Ok(Some(new_path))
}

// `nb.ipynb` -> `nb.py`, or `_nb.py`, `__nb.py`, ... if taken.
fn unused_python_path(path: &Path) -> PathBuf {
    let mut candidate = path.with_extension(PYTHON_EXTENSION);
    while candidate.exists() {
        let name = candidate
            .file_name()
            .map(|name| format!("_{}", name.to_string_lossy()))
            .unwrap_or_else(|| "_".to_string());
        candidate = candidate.with_file_name(name);
    }

    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NOTEBOOK: &str = r##"{
        "cells": [
            {"cell_type": "markdown", "source": ["# Title\n"]},
            {"cell_type": "code", "source": ["%matplotlib inline\n", "import math\n"]},
            {"cell_type": "code", "source": "print(math.pi)"}
        ],
        "nbformat": 4
    }"##;

    #[test]
    fn test_extract_notebook_code() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nb.ipynb");
        fs::write(&path, NOTEBOOK).unwrap();

        let code = extract_notebook_code(&path).unwrap();
        assert_eq!(code, "# %matplotlib inline\nimport math\n\nprint(math.pi)\n");
    }

    #[test]
    fn test_prep_source_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("nb.ipynb"), NOTEBOOK).unwrap();
        fs::write(dir.path().join("sub").join("nb.py"), "taken = True\n").unwrap();
        fs::write(dir.path().join("main.py"), "pass\n").unwrap();

        let renames = prep_source_files(dir.path()).unwrap();
        assert_eq!(renames.len(), 1);
        assert_eq!(renames["sub/_nb.py"], "sub/nb.ipynb");

        assert!(!dir.path().join("sub").join("nb.ipynb").exists());
        assert_eq!(fs::read_to_string(dir.path().join("sub").join("nb.py")).unwrap(), "taken = True\n");
        assert!(fs::read_to_string(dir.path().join("sub").join("_nb.py")).unwrap().contains("print(math.pi)"));
    }

    #[test]
    fn test_bad_notebook() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("broken.ipynb"), "{not json").unwrap();
        assert!(prep_source_files(dir.path()).is_err());
    }
}
