//! Sweep dispatch.
//!
//! [`JobRunner`] expands a parameter set, stages one directory per
//! configuration and hands each to either the local worker pool or a remote
//! batch scheduler.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use klynge_params::{ParameterSet, ParameterSpace};

use crate::{
    config::JobDescriptor,
    jobfile::{ClusterBackend, SCRIPT_NAME},
    pool::{PoolError, WorkerPool, WorkerTask},
    stage::{Stager, StagingError},
};

/// Where staged jobs are sent.
pub enum Dispatch {
    /// Run the job's commands on this machine.
    Local(WorkerPool),
    /// Write a submission script and submit it.
    Remote(Box<dyn ClusterBackend>),
}

impl Dispatch {
    fn describe(&self) -> String {
        match self {
            Self::Local(pool) => format!("local ({} workers)", pool.capacity()),
            Self::Remote(backend) => format!("remote ({})", backend.profile()),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Job directories staged.
    pub staged: usize,
    /// Jobs started locally or accepted by the scheduler.
    pub dispatched: usize,
    /// Jobs whose spawn or submission failed.
    pub failed: usize,
    /// Staged job directories in expansion order.
    pub directories: Vec<PathBuf>,
}

/// Stages and dispatches every configuration of a sweep.
pub struct JobRunner {
    template: JobDescriptor,
    stager: Stager,
    dispatch: Dispatch,
    dry_run: bool,
}

impl JobRunner {
    #[must_use]
    pub fn new(template: JobDescriptor, stager: Stager, dispatch: Dispatch, dry_run: bool) -> Self {
        Self {
            template,
            stager,
            dispatch,
            dry_run,
        }
    }

    /// The local pool, if dispatching locally.
    pub fn pool_mut(&mut self) -> Option<&mut WorkerPool> {
        match &mut self.dispatch {
            Dispatch::Local(pool) => Some(pool),
            Dispatch::Remote(_) => None,
        }
    }

    /// Stage and dispatch every configuration.
    ///
    /// Returns once the last configuration is dispatched; local workers may
    /// still be running.
    pub async fn run(&mut self, parameters: ParameterSet) -> Result<RunSummary, RunnerError> {
        let space = ParameterSpace::new(parameters);
        let total = space.size().ok_or(RunnerError::SpaceTooLarge)?;
        tracing::info!(
            "Dispatching {total} configurations of {} to {}{}",
            self.template.name,
            self.dispatch.describe(),
            if self.dry_run { " [dry run]" } else { "" }
        );
        for (key, values) in space.swept() {
            tracing::debug!("Sweeping {key} over {} values", values.len());
        }

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {msg:20} [{wide_bar:.cyan/blue}] {pos:>4}/{len:4}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#*-"),
        );

        let mut summary = RunSummary::default();
        for config in &space {
            let name = format!("{}{}", self.template.name, config.index());
            pb.set_message(name.clone());

            let dir = self.stager.stage(&name, &config)?;
            summary.staged += 1;

            let dispatched = match &mut self.dispatch {
                Dispatch::Local(pool) => {
                    Self::dispatch_local(pool, &self.template, name, dir.clone(), self.dry_run)
                        .await?
                }
                Dispatch::Remote(backend) => Self::dispatch_remote(
                    backend.as_ref(),
                    &self.template,
                    &self.stager,
                    name,
                    &dir,
                    self.dry_run,
                )?,
            };
            match dispatched {
                Some(true) => summary.dispatched += 1,
                Some(false) => summary.failed += 1,
                None => {}
            }

            summary.directories.push(dir);
            pb.inc(1);
        }
        pb.finish_and_clear();

        tracing::info!(
            "Staged {}, dispatched {}, failed {}",
            summary.staged,
            summary.dispatched,
            summary.failed
        );
        Ok(summary)
    }

    /// [`run`](Self::run), then wait for every local worker.
    ///
    /// Workers already started are drained even when the sweep aborts; the
    /// sweep's error wins over a drain error.
    pub async fn run_to_completion(&mut self, parameters: ParameterSet) -> Result<RunSummary, RunnerError> {
        let result = self.run(parameters).await;
        if let Some(pool) = self.pool_mut() {
            if let Err(e) = &result
                && pool.occupied() > 0
            {
                tracing::warn!("Sweep aborted ({e}), waiting for {} running workers", pool.occupied());
            }
            match pool.drain().await {
                Err(drain_err) if result.is_err() => tracing::error!("{drain_err}"),
                Err(drain_err) => return Err(drain_err.into()),
                Ok(()) => {}
            }
        }
        result
    }

    /// `None` when nothing was attempted, otherwise whether dispatch succeeded.
    async fn dispatch_local(
        pool: &mut WorkerPool,
        template: &JobDescriptor,
        name: String,
        dir: PathBuf,
        dry_run: bool,
    ) -> Result<Option<bool>, RunnerError> {
        if dry_run {
            tracing::info!("Would run {name} locally");
            return Ok(None);
        }
        let task = WorkerTask {
            name,
            dir,
            commands: template.commands.clone(),
        };
        match pool.admit(task).await {
            Ok(_) => Ok(Some(true)),
            Err(e @ PoolError::Spawn { .. }) => {
                tracing::error!("{e}");
                Ok(Some(false))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch_remote(
        backend: &dyn ClusterBackend,
        template: &JobDescriptor,
        stager: &Stager,
        name: String,
        dir: &std::path::Path,
        dry_run: bool,
    ) -> Result<Option<bool>, RunnerError> {
        let mut infiles = stager.staged_inputs();
        for file in &template.infiles {
            if !infiles.contains(file) {
                infiles.push(file.clone());
            }
        }
        let job = JobDescriptor {
            name,
            infiles,
            ..template.clone()
        };
        let script_path = dir.join(SCRIPT_NAME);
        std::fs::write(&script_path, backend.render(&job))
            .map_err(|e| RunnerError::Script(script_path.clone(), e))?;
        tracing::debug!("Wrote {}", script_path.display());

        if dry_run {
            tracing::info!("Would submit {}", job.name);
            return Ok(None);
        }
        match backend.submit(dir) {
            Ok(()) => Ok(Some(true)),
            Err(e) => {
                tracing::error!("Submitting {} failed: {e}", job.name);
                Ok(Some(false))
            }
        }
    }
}

/// Errors that abort a sweep.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("staging failed: {0}")]
    Staging(#[from] StagingError),
    #[error("worker pool failed: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to write {0}: {1}")]
    Script(PathBuf, std::io::Error),
    #[error("parameter space has more configurations than can be counted")]
    SpaceTooLarge,
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use klynge_params::Value;
    use tempfile::tempdir;

    use super::*;
    use crate::jobfile::Abel;

    fn sweep() -> ParameterSet {
        [
            ("x", Value::Int(1)),
            ("y", Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
        ]
        .into_iter()
        .collect()
    }

    fn template(commands: &[&str]) -> JobDescriptor {
        JobDescriptor {
            name: "friction".to_string(),
            commands: commands.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    fn stager(base: &Path) -> Stager {
        fs::create_dir_all(base.join("input")).unwrap();
        fs::write(base.join("input/parameters.txt"), "x 1\ny [1,2,3]\n").unwrap();
        Stager::new(base, "jobs", "input/parameters.txt", vec![PathBuf::from("input")])
    }

    #[tokio::test]
    async fn test_dry_run_remote_writes_scripts_only() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("submitted");
        let backend = Abel::new(Some(vec![
            "sh".into(),
            "-c".into(),
            format!("touch {}", marker.display()),
        ]));
        let mut runner = JobRunner::new(
            template(&["./simulate"]),
            stager(dir.path()),
            Dispatch::Remote(Box::new(backend)),
            true,
        );

        let summary = runner.run(sweep()).await.unwrap();
        assert_eq!(summary.staged, 3);
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.failed, 0);
        assert!(!marker.exists());
        assert!(runner.pool_mut().is_none());

        for (i, job_dir) in summary.directories.iter().enumerate() {
            assert_eq!(job_dir, &dir.path().join(format!("jobs/friction{i}")));
            let script = fs::read_to_string(job_dir.join(SCRIPT_NAME)).unwrap();
            assert!(script.contains(&format!("#SBATCH --job-name=friction{i}\n")));
            assert!(script.contains("cp -r $SUBMITDIR/input/parameters.txt $SCRATCH\n"));
            assert!(script.contains("cp -r $SUBMITDIR/input $SCRATCH\n"));
            assert_eq!(
                fs::read_to_string(job_dir.join("input/parameters.txt")).unwrap(),
                format!("x 1\ny {}\n", i + 1)
            );
        }
    }

    #[tokio::test]
    async fn test_template_infiles_follow_staged_inputs() {
        let dir = tempdir().unwrap();
        let job = JobDescriptor {
            infiles: vec!["input".into(), "tables/friction.dat".into()],
            ..template(&[])
        };
        let mut runner = JobRunner::new(
            job,
            stager(dir.path()),
            Dispatch::Remote(Box::new(Abel::new(None))),
            true,
        );
        let summary = runner.run(sweep()).await.unwrap();

        let script = fs::read_to_string(summary.directories[0].join(SCRIPT_NAME)).unwrap();
        let copies: Vec<&str> = script.lines().filter(|l| l.starts_with("cp -r")).collect();
        assert_eq!(
            copies,
            [
                "cp -r $SUBMITDIR/input/parameters.txt $SCRATCH",
                "cp -r $SUBMITDIR/input $SCRATCH",
                "cp -r $SUBMITDIR/tables/friction.dat $SCRATCH",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_submissions_are_counted() {
        let dir = tempdir().unwrap();
        let backend = Abel::new(Some(vec!["sh".into(), "-c".into(), "exit 1".into()]));
        let mut runner = JobRunner::new(
            template(&[]),
            stager(dir.path()),
            Dispatch::Remote(Box::new(backend)),
            false,
        );
        let summary = runner.run(sweep()).await.unwrap();
        assert_eq!(summary.staged, 3);
        assert_eq!(summary.failed, 3);
    }

    #[tokio::test]
    async fn test_local_dispatch_runs_commands() {
        let dir = tempdir().unwrap();
        let mut runner = JobRunner::new(
            template(&["cp input/parameters.txt out.txt"]),
            stager(dir.path()),
            Dispatch::Local(WorkerPool::new(2).unwrap()),
            false,
        );

        let summary = runner.run(sweep()).await.unwrap();
        assert_eq!(summary.dispatched, 3);
        runner.pool_mut().unwrap().drain().await.unwrap();

        for (i, job_dir) in summary.directories.iter().enumerate() {
            assert_eq!(
                fs::read_to_string(job_dir.join("out.txt")).unwrap(),
                format!("x 1\ny {}\n", i + 1)
            );
        }
    }

    #[tokio::test]
    async fn test_local_dry_run_starts_nothing() {
        let dir = tempdir().unwrap();
        let mut runner = JobRunner::new(
            template(&["touch ran"]),
            stager(dir.path()),
            Dispatch::Local(WorkerPool::new(1).unwrap()),
            true,
        );
        let summary = runner.run(sweep()).await.unwrap();
        assert_eq!(summary.staged, 3);
        assert_eq!(runner.pool_mut().unwrap().occupied(), 0);
        assert!(summary.directories.iter().all(|d| !d.join("ran").exists()));
    }

    #[tokio::test]
    async fn test_staging_failure_aborts() {
        let dir = tempdir().unwrap();
        let stager = Stager::new(dir.path(), "jobs", "p.txt", vec![PathBuf::from("missing")]);
        let mut runner = JobRunner::new(
            template(&[]),
            stager,
            Dispatch::Remote(Box::new(Abel::new(None))),
            true,
        );
        let err = runner.run(sweep()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Staging(StagingError::MissingSource(_))));
    }

    #[tokio::test]
    async fn test_uncountable_space_is_rejected_before_staging() {
        let dir = tempdir().unwrap();
        let parameters: ParameterSet = (0..65)
            .map(|i| (format!("p{i}"), Value::Seq(vec![Value::Int(0), Value::Int(1)])))
            .collect();
        let mut runner = JobRunner::new(
            template(&[]),
            stager(dir.path()),
            Dispatch::Remote(Box::new(Abel::new(None))),
            true,
        );
        let err = runner.run(parameters).await.unwrap_err();
        assert!(matches!(err, RunnerError::SpaceTooLarge));
        assert!(!dir.path().join("jobs").exists());
    }

    #[tokio::test]
    async fn test_aborted_sweep_still_drains_workers() {
        let dir = tempdir().unwrap();
        let stager = stager(dir.path());
        fs::create_dir_all(dir.path().join("jobs")).unwrap();
        fs::write(dir.path().join("jobs/friction1"), "in the way").unwrap();

        let mut runner = JobRunner::new(
            template(&["sleep 0.3", "touch finished"]),
            stager,
            Dispatch::Local(WorkerPool::new(1).unwrap()),
            false,
        );
        let err = runner.run_to_completion(sweep()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Staging(_)));
        assert!(dir.path().join("jobs/friction0/finished").exists());
        assert_eq!(runner.pool_mut().unwrap().occupied(), 0);
    }
}
