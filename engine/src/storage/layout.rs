//! Project directory layout

use std::path::{Path, PathBuf};

use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::project::Upn;

/// Compose file name inside a project directory
pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";

/// Registry credentials file written by `docker --config ./ login`
pub const DOCKER_CONFIG_FILE_NAME: &str = "config.json";

/// Directory holding per-service persistent volumes
pub const PERSISTENT_VOLUME_DIR_NAME: &str = "data";

/// Suffix used for backup snapshots during a deployment transaction
pub const BACKUP_SUFFIX: &str = "tmp";

/// Suffix of a project directory awaiting permanent removal
pub const DELETED_SUFFIX: &str = "deleted";

/// Resolves every on-disk location of a project from its UPN
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    /// Root directory holding all projects
    pub projects_dir: PathBuf,
}

impl ProjectLayout {
    /// Create a new layout rooted at `projects_dir`
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    /// The projects root
    pub fn root(&self) -> &Path {
        &self.projects_dir
    }

    /// Project directory, `<projects_dir>/<upn>`
    pub fn project_dir(&self, upn: &Upn) -> Dir {
        Dir::new(self.projects_dir.join(upn.as_str()))
    }

    /// Project directory renamed aside for deletion
    pub fn deleted_project_dir(&self, upn: &Upn) -> Dir {
        Dir::new(
            self.projects_dir
                .join(format!("{}-{}", upn.as_str(), DELETED_SUFFIX)),
        )
    }

    /// The canonical compose file
    pub fn compose_file(&self, upn: &Upn) -> File {
        self.project_dir(upn).file(COMPOSE_FILE_NAME)
    }

    /// The auxiliary registry config file
    pub fn docker_config_file(&self, upn: &Upn) -> File {
        self.project_dir(upn).file(DOCKER_CONFIG_FILE_NAME)
    }

    /// Files snapshotted before a deployment is applied
    pub fn config_files(&self, upn: &Upn) -> [File; 2] {
        [self.compose_file(upn), self.docker_config_file(upn)]
    }

    /// Root of all persistent volumes of a project
    pub fn volumes_dir(&self, upn: &Upn) -> Dir {
        self.project_dir(upn).subdir(PERSISTENT_VOLUME_DIR_NAME)
    }

    /// Persistent volume directory of one service
    pub fn service_volume_dir(&self, upn: &Upn, usn: &str) -> Dir {
        self.volumes_dir(upn).subdir(usn)
    }
}
