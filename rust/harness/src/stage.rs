//! Job directory staging.
//!
//! Every configuration gets its own directory under the job root holding a
//! copy of the project paths and the resolved parameter file.

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use klynge_params::Configuration;
use walkdir::WalkDir;

/// Stages job directories for a sweep.
#[derive(Debug, Clone)]
pub struct Stager {
    /// Project root that relative paths resolve against.
    base: PathBuf,
    /// Directory receiving the per-job directories.
    root: PathBuf,
    /// Parameter file, relative to `base`.
    config_path: PathBuf,
    project_paths: Vec<PathBuf>,
}

impl Stager {
    /// Create a stager. A relative `root` resolves against `base`.
    #[must_use]
    pub fn new(
        base: impl Into<PathBuf>,
        root: impl AsRef<Path>,
        config_path: impl Into<PathBuf>,
        project_paths: Vec<PathBuf>,
    ) -> Self {
        let base = base.into();
        let root = base.join(root);
        Self {
            base,
            root,
            config_path: config_path.into(),
            project_paths,
        }
    }

    /// Directory receiving the per-job directories.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a path lands inside a job directory.
    ///
    /// Paths under the project root keep their relative location; anything
    /// else is staged under its final component.
    fn target_of(&self, path: &Path) -> PathBuf {
        let relative = if path.is_absolute() {
            match path.strip_prefix(&self.base) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => path.file_name().map(PathBuf::from).unwrap_or_default(),
            }
        } else {
            path.to_path_buf()
        };
        relative
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect()
    }

    /// Inputs a job script must copy to scratch: the parameter file first,
    /// then each project path.
    #[must_use]
    pub fn staged_inputs(&self) -> Vec<String> {
        std::iter::once(&self.config_path)
            .chain(&self.project_paths)
            .map(|p| self.target_of(p).display().to_string())
            .collect()
    }

    /// Stage one configuration into `{root}/{job_name}` and return that directory.
    pub fn stage(&self, job_name: &str, config: &Configuration) -> Result<PathBuf, StagingError> {
        fs::create_dir_all(&self.root).map_err(|e| StagingError::CreateDir(self.root.clone(), e))?;
        let job_dir = self.root.join(job_name);
        tracing::debug!("Making {}", job_dir.display());
        fs::create_dir_all(&job_dir).map_err(|e| StagingError::CreateDir(job_dir.clone(), e))?;

        for path in &self.project_paths {
            let src = self.base.join(path);
            let dst = job_dir.join(self.target_of(path));
            tracing::debug!("Copying {} to {}", src.display(), dst.display());
            copy_path(&src, &dst)?;
        }

        let config_file = job_dir.join(self.target_of(&self.config_path));
        tracing::debug!(
            "Writing configuration {} to {}",
            config.index(),
            config_file.display()
        );
        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent).map_err(|e| StagingError::CreateDir(parent.to_path_buf(), e))?;
        }
        fs::write(&config_file, config.render())
            .map_err(|e| StagingError::Write(config_file.clone(), e))?;

        tracing::info!("Staged {job_name} in {}", job_dir.display());
        Ok(job_dir)
    }
}

/// Copy a file or a directory tree.
fn copy_path(src: &Path, dst: &Path) -> Result<(), StagingError> {
    if !src.exists() {
        return Err(StagingError::MissingSource(src.to_path_buf()));
    }
    if src.is_file() {
        return copy_file(src, dst);
    }
    if dst.exists() && !dst.is_dir() {
        return Err(StagingError::NotADirectory(dst.to_path_buf()));
    }

    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| StagingError::Walk(src.to_path_buf(), e))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| StagingError::CreateDir(target.clone(), e))?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copy one file; on failure create the missing parents and retry once.
fn copy_file(src: &Path, dst: &Path) -> Result<(), StagingError> {
    if fs::copy(src, dst).is_ok() {
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| StagingError::CreateDir(parent.to_path_buf(), e))?;
    }
    fs::copy(src, dst)
        .map(|_| ())
        .map_err(|e| StagingError::Copy {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            source: e,
        })
}

/// Errors that can occur while staging a job directory.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("{0} does not exist")]
    MissingSource(PathBuf),
    #[error("{0} already exists as non-dir")]
    NotADirectory(PathBuf),
    #[error("failed to create directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to copy {src} to {dst}: {source}", src = src.display(), dst = dst.display())]
    Copy {
        src: PathBuf,
        dst: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to walk {0}: {1}")]
    Walk(PathBuf, walkdir::Error),
}
