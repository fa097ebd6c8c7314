/// Fetch - Materialize FileSpecs on Disk
///
/// **Core Responsibility:**
/// Put the target of a `FileSpec` into a destination directory. Path specs
/// are copied from the local filesystem; git specs are cloned and URL specs
/// are downloaded.
///
/// **Credentials:**
/// Git usernames and tokens are spliced into the clone URL only for the
/// child process. They are never logged (`FileSpec`'s Display redacts them).

use anyhow::{bail, Context, Result};
use autograder_common::fileop::{exec_file_operations, FileOperation};
use autograder_common::filespec::FileSpec;
use autograder_common::fsutil::remove_dirent;
use autograder_common::AutograderError;
use reqwest::Url;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Copy one spec into `dest_dir`. Relative path specs resolve against `base_dir`.
#[tracing::instrument(skip_all, fields(spec = %spec))]
pub async fn copy_file_spec(spec: &FileSpec, base_dir: &Path, dest_dir: &Path) -> Result<()> {
    if spec.is_git() {
        clone_git(spec, dest_dir).await
    } else if spec.is_url() {
        download_url(spec, dest_dir).await
    } else {
        spec.copy_local_target(base_dir, dest_dir)
    }
}

/// Run `pre_ops`, copy every spec, then run `post_ops`.
/// Operations execute relative to `ops_base_dir`.
pub async fn copy_file_specs(
    source_dir: &Path,
    dest_dir: &Path,
    ops_base_dir: &Path,
    specs: &[FileSpec],
    pre_ops: &[FileOperation],
    post_ops: &[FileOperation],
) -> Result<()> {
    exec_file_operations(pre_ops, ops_base_dir).context("Failed to run pre-copy file operations")?;

    for spec in specs {
        copy_file_spec(spec, source_dir, dest_dir)
            .await
            .with_context(|| format!("Failed to copy file spec '{}'", spec))?;
    }

    exec_file_operations(post_ops, ops_base_dir).context("Failed to run post-copy file operations")?;

    Ok(())
}

async fn clone_git(spec: &FileSpec, dest_dir: &Path) -> Result<()> {
    let dest = spec.get_dest(dest_dir);
    prepare_dest(&dest).await?;

    let url = authenticated_url(&spec.path, &spec.username, &spec.token)?;

    info!(repo = %spec.path, reference = %spec.reference, dest = %dest.display(), "Cloning git repo");

    let mut clone = Command::new("git");
    clone.arg("clone").arg("--quiet").arg(url.as_str()).arg(&dest);
    run_git(clone, &spec.path).await?;

    if !spec.reference.is_empty() {
        let mut checkout = Command::new("git");
        checkout.arg("-C").arg(&dest).arg("checkout").arg("--quiet").arg(&spec.reference);
        run_git(checkout, &spec.path)
            .await
            .with_context(|| format!("Failed to checkout reference '{}'", spec.reference))?;
    }

    Ok(())
}

async fn run_git(mut command: Command, repo: &str) -> Result<()> {
    command.env("GIT_TERMINAL_PROMPT", "0");

    let output = command
        .output()
        .await
        .context("Failed to spawn git (is it installed?)")?;

    if !output.status.success() {
        return Err(AutograderError::tool(
            format!("git exited with {} for repo '{}'", output.status, repo),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        )
        .into());
    }

    Ok(())
}

fn authenticated_url(raw: &str, username: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("Invalid git URL '{}'", raw))?;

    if username.is_empty() && token.is_empty() {
        return Ok(url);
    }

    if url.cannot_be_a_base() || !url.scheme().starts_with("http") {
        bail!("Git credentials are only supported for http(s) URLs, got '{}'", raw);
    }

    let user = if username.is_empty() { "git" } else { username };
    if url.set_username(user).is_err() || url.set_password(Some(token).filter(|t| !t.is_empty())).is_err() {
        bail!("Could not attach credentials to git URL '{}'", raw);
    }

    Ok(url)
}

async fn download_url(spec: &FileSpec, dest_dir: &Path) -> Result<()> {
    let dest = spec.get_dest(dest_dir);
    prepare_dest(&dest).await?;

    debug!(url = %spec.path, dest = %dest.display(), "Downloading file spec");

    let response = reqwest::get(&spec.path)
        .await
        .with_context(|| format!("Failed to fetch '{}'", spec.path))?
        .error_for_status()
        .with_context(|| format!("Bad response for '{}'", spec.path))?;

    let body = response
        .bytes()
        .await
        .with_context(|| format!("Failed to read body of '{}'", spec.path))?;

    tokio::fs::write(&dest, &body)
        .await
        .with_context(|| format!("Failed to write '{}'", dest.display()))?;

    Ok(())
}

// Fetched targets replace whatever was at the destination.
async fn prepare_dest(dest: &Path) -> Result<()> {
    remove_dirent(dest)?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create dir '{}'", parent.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::fileop::FileOperation;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_authenticated_url() {
        let url = authenticated_url("https://github.com/org/repo.git", "", "").unwrap();
        assert_eq!(url.as_str(), "https://github.com/org/repo.git");

        let url = authenticated_url("https://github.com/org/repo.git", "alice", "s3cret").unwrap();
        assert_eq!(url.username(), "alice");
        assert_eq!(url.password(), Some("s3cret"));

        let url = authenticated_url("https://github.com/org/repo.git", "", "s3cret").unwrap();
        assert_eq!(url.username(), "git");

        assert!(authenticated_url("not a url", "", "").is_err());
    }

    #[tokio::test]
    async fn test_copy_file_specs_with_ops() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();

        fs::write(source.path().join("a.txt"), "A").unwrap();
        fs::create_dir(source.path().join("dir")).unwrap();
        fs::write(source.path().join("dir").join("b.txt"), "B").unwrap();

        let specs = vec![FileSpec::path("a.txt"), FileSpec::path_with_dest("dir", "renamed")];
        let post_ops = vec![FileOperation::copy("a.txt", "renamed/a-copy.txt").unwrap()];

        copy_file_specs(source.path(), dest.path(), dest.path(), &specs, &[], &post_ops)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("a.txt")).unwrap(), "A");
        assert_eq!(fs::read_to_string(dest.path().join("renamed").join("b.txt")).unwrap(), "B");
        assert_eq!(fs::read_to_string(dest.path().join("renamed").join("a-copy.txt")).unwrap(), "A");
    }

    #[tokio::test]
    async fn test_missing_path_spec() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();

        let result = copy_file_spec(&FileSpec::path("missing.txt"), source.path(), dest.path()).await;
        assert!(result.is_err());

        // Empty specs are no-ops.
        copy_file_spec(&FileSpec::empty(), source.path(), dest.path()).await.unwrap();
    }
}
