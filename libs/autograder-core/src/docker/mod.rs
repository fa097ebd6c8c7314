/// Docker - Container Runs and Grading Images
///
/// **Layout:**
/// - `run`: the `ContainerRunner` seam and its bollard implementation
/// - `image`: build contexts, Dockerfiles, image builds, rebuild detection
/// - `copy`: in-container directory copies with a host fallback
///
/// The runner is optional at runtime: with `docker-disable` set there is no
/// `DockerRunner` and callers take their host-side fallbacks.

pub mod copy;
pub mod image;
pub mod run;

#[cfg(test)]
mod docker_tests;

pub use copy::copy_dir_contents_in_container;
pub use image::{build_image, build_image_from_source, need_rebuild, write_docker_context, ImageBuildCache, ImageInfo};
pub use run::{ContainerRunner, DockerRunner, MountInfo, RunOutput, RunRequest};
