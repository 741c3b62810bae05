//! Batch scheduler submission scripts.
//!
//! Each cluster profile implements [`ClusterBackend`]: it renders the job
//! script and knows how to hand a staged job directory to the scheduler.

use std::{fmt::Write as _, path::Path, process::Command};

use crate::config::{ClusterProfile, JobDescriptor};

/// File name of the rendered script inside a job directory.
pub const SCRIPT_NAME: &str = "jobfile";

/// A remote batch scheduler back-end.
pub trait ClusterBackend: Send + Sync {
    /// Profile implemented by this back-end.
    fn profile(&self) -> ClusterProfile;

    /// Render the submission script for one job.
    fn render(&self, job: &JobDescriptor) -> String;

    /// Submit the script in `job_dir`, running from inside that directory.
    fn submit(&self, job_dir: &Path) -> Result<(), SubmissionError>;
}

/// Build the back-end for a profile.
///
/// `submit_command` replaces the profile's default submission command.
#[must_use]
pub fn backend(
    profile: ClusterProfile,
    submit_command: Option<Vec<String>>,
) -> Box<dyn ClusterBackend> {
    match profile {
        ClusterProfile::Abel => Box::new(Abel::new(submit_command)),
    }
}

/// Slurm on Abel.
#[derive(Debug, Clone)]
pub struct Abel {
    submit_command: Vec<String>,
}

impl Abel {
    #[must_use]
    pub fn new(submit_command: Option<Vec<String>>) -> Self {
        Self {
            submit_command: submit_command
                .unwrap_or_else(|| vec!["sbatch".to_string(), SCRIPT_NAME.to_string()]),
        }
    }

    fn environment(job: &JobDescriptor) -> String {
        let mut env = String::from(
            "source /cluster/bin/jobsetup\n\
             # Remove any previously loaded modules\n\
             module purge\n\
             # Exit on any errors after this point\n\
             set -o errexit\n",
        );
        for module in &job.modules {
            let _ = writeln!(env, "module load {module}");
        }
        env.push_str("# Copy files to work directory\n");
        for file in &job.infiles {
            let _ = writeln!(env, "cp -r $SUBMITDIR/{file} $SCRATCH");
        }
        if !job.outfiles.is_empty() {
            env.push_str("# Mark outfiles for automatic copying to $SUBMITDIR\n");
            let _ = writeln!(env, "chkfile {}", job.outfiles.join(" "));
        }
        env.push_str("cd $SCRATCH\n");
        env
    }
}

impl ClusterBackend for Abel {
    fn profile(&self) -> ClusterProfile {
        ClusterProfile::Abel
    }

    fn render(&self, job: &JobDescriptor) -> String {
        let (hours, minutes, seconds) = job.wall_time_hms();
        let mut script = format!(
            "#!/bin/sh\n\
             # Job name:\n\
             #SBATCH --job-name={name}\n\
             #\n\
             # Project:\n\
             #SBATCH --account={account}\n\
             # Wall time limit:\n\
             #SBATCH --time={hours:02}:{minutes:02}:{seconds:02}\n\
             #\n\
             # Max memory usage per core:\n\
             #SBATCH --mem-per-cpu={mem}\n\
             #SBATCH --cpus-per-task={cpus}\n",
            name = job.name,
            account = job.account,
            mem = job.mem_per_cpu,
            cpus = job.cpus_per_task,
        );
        if job.exclusive {
            script.push_str("#SBATCH --exclusive\n");
        }
        if let Some(ref mail) = job.mail_type {
            let _ = writeln!(script, "#SBATCH --mail-type={mail}");
        }
        script.push_str("#\n\n# Set up the job environment\n");
        script.push_str(&Self::environment(job));
        script.push_str("# Run custom commands\n");
        for command in &job.commands {
            let _ = writeln!(script, "{command}");
        }

        tracing::debug!("Rendered jobfile for {}:\n{script}", job.name);
        script
    }

    fn submit(&self, job_dir: &Path) -> Result<(), SubmissionError> {
        let (program, args) = self
            .submit_command
            .split_first()
            .ok_or(SubmissionError::EmptyCommand)?;
        let command_line = self.submit_command.join(" ");

        tracing::debug!("Submitting in {}: {command_line}", job_dir.display());
        let output = Command::new(program)
            .args(args)
            .current_dir(job_dir)
            .output()
            .map_err(|e| SubmissionError::Launch(command_line.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubmissionError::Rejected {
                command: command_line,
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        tracing::info!("Submitted {}: {}", job_dir.display(), stdout.trim());
        Ok(())
    }
}

/// Errors that can occur when submitting a job.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("submission command is empty")]
    EmptyCommand,
    #[error("failed to run `{0}`: {1}")]
    Launch(String, std::io::Error),
    #[error("`{command}` exited with {code:?}: {stderr}")]
    Rejected {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}
