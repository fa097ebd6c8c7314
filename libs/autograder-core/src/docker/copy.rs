// Directory copies that run inside a container so the copies are owned by the container user.
use super::run::{ContainerRunner, MountInfo, RunRequest};
use anyhow::{Context, Result};
use autograder_common::fsutil::{copy_dir_contents, recursive_chmod, OPEN_DIR_MODE, OPEN_FILE_MODE};
use autograder_common::AutograderError;
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

const COPY_SOURCE_DIR: &str = "/copy/source";
const COPY_DEST_DIR: &str = "/copy/dest";
const COPY_MAX_SECS: u64 = 60;

/// Copy the entries of `source` into `dest` using `image`.
/// Without a runner (containers disabled) this is a plain host copy.
pub async fn copy_dir_contents_in_container(
    runner: Option<&dyn ContainerRunner>,
    image: &str,
    source: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(runner) = runner else {
        return copy_dir_contents(source, dest);
    };

    if !source.is_dir() {
        return Err(AutograderError::not_found(format!("Source of directory copy ('{}') is not a dir", source.display())).into());
    }

    fs::create_dir_all(dest).with_context(|| format!("Failed to create dest dir '{}'", dest.display()))?;
    recursive_chmod(dest, OPEN_FILE_MODE, OPEN_DIR_MODE)?;

    let request = RunRequest {
        image: image.to_string(),
        mounts: vec![
            MountInfo::read_only(source, COPY_SOURCE_DIR),
            MountInfo::read_write(dest, COPY_DEST_DIR),
        ],
        args: vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cp -r {}/. {}/", COPY_SOURCE_DIR, COPY_DEST_DIR),
        ],
        base_name: "copy-dir".to_string(),
        max_secs: COPY_MAX_SECS,
    };

    runner.run_container(&request, cancel).await?.check("Copy", COPY_MAX_SECS)?;

    Ok(())
}
