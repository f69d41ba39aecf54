// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Single-slot background worker for penalizer passes.
//!
//! A pass rewrites a fixed output dataset and is followed by an external
//! preprocessing [Pipeline] and a routing engine restart, so at most one
//! job may be in flight. [JobRunner::submit] rejects overlapping jobs with [Error::Busy].
//! Across processes, [run_job] claims the output dataset with a `<dataset>.lock`
//! file and fails with [Error::Busy] if it already exists. A lock file left over
//! by a killed process has to be removed by hand.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::penalize::{self, PenalizeStats};

/// Downstream processing of a penalized dataset.
pub trait Pipeline: Send + Sync {
    /// Runs all preprocessing stages over the penalized dataset.
    fn run(&self, dataset: &Path) -> Result<()>;

    /// Lists files which must exist after a successful [Pipeline::run].
    fn artifacts(&self, dataset: &Path) -> Vec<PathBuf>;

    /// Restarts the consumer of the artifacts.
    fn restart(&self) -> Result<()>;
}

impl<P: Pipeline + ?Sized> Pipeline for Box<P> {
    fn run(&self, dataset: &Path) -> Result<()> {
        (**self).run(dataset)
    }

    fn artifacts(&self, dataset: &Path) -> Vec<PathBuf> {
        (**self).artifacts(dataset)
    }

    fn restart(&self) -> Result<()> {
        (**self).restart()
    }
}

/// [Pipeline] which does nothing - the penalized dataset is the final product.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPipeline;

impl Pipeline for NoPipeline {
    fn run(&self, _: &Path) -> Result<()> {
        Ok(())
    }

    fn artifacts(&self, _: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    fn restart(&self) -> Result<()> {
        Ok(())
    }
}

/// Path of a file derived from `dataset`, with all extensions of the dataset
/// replaced by `extension`: `region_avoidzones.osm.gz` and `osrm.cells` give
/// `region_avoidzones.osrm.cells`.
pub fn artifact_path(dataset: &Path, extension: &str) -> PathBuf {
    let name = dataset.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stem = name.split_once('.').map_or(name, |(stem, _)| stem);
    dataset.with_file_name(format!("{}.{}", stem, extension))
}

/// [Pipeline] running external commands.
///
/// The `{dataset}` placeholder in command arguments is replaced by the path
/// to the penalized dataset. Expected artifacts are named after the dataset,
/// see [artifact_path].
#[derive(Debug, Clone, Default)]
pub struct CommandPipeline {
    pub stages: Vec<Vec<String>>,
    pub artifact_extensions: Vec<String>,
    pub restart: Option<Vec<String>>,
    pub stage_timeout: Option<Duration>,
}

impl CommandPipeline {
    fn run_command(&self, args: &[String], dataset: Option<&Path>) -> Result<()> {
        let Some((program, args)) = args.split_first() else {
            return Ok(());
        };

        let args = args
            .iter()
            .map(|a| match dataset {
                Some(d) => a.replace("{dataset}", &d.to_string_lossy()),
                None => a.clone(),
            })
            .collect::<Vec<_>>();

        log::info!("running {} {}", program, args.join(" "));
        let mut child = Command::new(program).args(&args).spawn()?;

        let status = match self.stage_timeout {
            None => child.wait()?,
            Some(timeout) => match wait_timeout(&mut child, timeout)? {
                Some(status) => status,
                None => {
                    child.kill()?;
                    child.wait()?;
                    return Err(Error::Pipeline(format!(
                        "{} timed out after {:?}",
                        program, timeout
                    )));
                }
            },
        };

        if status.success() {
            Ok(())
        } else {
            Err(Error::Pipeline(format!("{} failed: {}", program, status)))
        }
    }
}

fn wait_timeout(child: &mut std::process::Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        } else if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

impl Pipeline for CommandPipeline {
    fn run(&self, dataset: &Path) -> Result<()> {
        for stage in &self.stages {
            self.run_command(stage, Some(dataset))?;
        }
        Ok(())
    }

    fn artifacts(&self, dataset: &Path) -> Vec<PathBuf> {
        self.artifact_extensions
            .iter()
            .map(|ext| artifact_path(dataset, ext))
            .collect()
    }

    fn restart(&self) -> Result<()> {
        match &self.restart {
            Some(args) => self.run_command(args, None),
            None => Ok(()),
        }
    }
}

/// Inputs of a single penalizer pass, see [penalize::penalize].
#[derive(Debug, Clone)]
pub struct PenalizeJob {
    pub input: PathBuf,
    pub zone_config: PathBuf,
    pub output: PathBuf,
    pub options: penalize::Options,
}

/// Observable state of the [JobRunner].
#[derive(Debug, Clone, Default)]
pub enum JobStatus {
    #[default]
    Idle,
    Running {
        id: u64,
    },
    Succeeded {
        id: u64,
        stats: PenalizeStats,
    },
    Failed {
        id: u64,
        error: Error,
    },
}

impl JobStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

#[derive(Default)]
struct Slot {
    status: JobStatus,
    last_id: u64,
}

/// Owns the worker thread executing [PenalizeJob]s, one at a time.
pub struct JobRunner {
    pipeline: Arc<dyn Pipeline>,
    slot: Arc<(Mutex<Slot>, Condvar)>,
}

impl JobRunner {
    pub fn new<P: Pipeline + 'static>(pipeline: P) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            slot: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a job in the background and returns its id.
    ///
    /// Fails with [Error::Busy] if another job is still running.
    pub fn submit(&self, job: PenalizeJob) -> Result<u64> {
        let mut slot = self.lock();
        if slot.status.is_running() {
            return Err(Error::Busy);
        }

        let id = slot.last_id + 1;
        let pipeline = Arc::clone(&self.pipeline);
        let shared = Arc::clone(&self.slot);

        thread::Builder::new()
            .name("penalizer".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| run_job(&job, pipeline.as_ref())))
                    .unwrap_or_else(|_| Err(Error::Pipeline("penalizer thread panicked".to_string())));
                let status = match result {
                    Ok(stats) => {
                        log::info!("penalizer job {} finished", id);
                        JobStatus::Succeeded { id, stats }
                    }
                    Err(error) => {
                        log::error!("penalizer job {} failed: {}", id, error);
                        JobStatus::Failed { id, error }
                    }
                };

                let (lock, done) = &*shared;
                lock.lock().unwrap_or_else(PoisonError::into_inner).status = status;
                done.notify_all();
            })?;

        slot.last_id = id;
        slot.status = JobStatus::Running { id };
        log::info!("penalizer job {} started", id);
        Ok(id)
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status.clone()
    }

    /// Blocks until no job is running and returns the final status.
    pub fn wait(&self) -> JobStatus {
        let mut slot = self.lock();
        while slot.status.is_running() {
            slot = self.slot.1.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
        slot.status.clone()
    }
}

/// Exclusive claim on an output dataset, released on drop.
struct DatasetLock(PathBuf);

impl DatasetLock {
    fn acquire(dataset: &Path) -> Result<Self> {
        let mut path = dataset.as_os_str().to_owned();
        path.push(".lock");
        let path = PathBuf::from(path);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                writeln!(f, "{}", std::process::id())?;
                Ok(Self(path))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                log::warn!("{} exists, another job is using the dataset", path.display());
                Err(Error::Busy)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            log::warn!("failed to remove {}: {}", self.0.display(), e);
        }
    }
}

/// Executes a penalizer pass followed by the [Pipeline].
/// The restart step only runs if all declared artifacts are present.
pub fn run_job(job: &PenalizeJob, pipeline: &dyn Pipeline) -> Result<PenalizeStats> {
    let _lock = DatasetLock::acquire(&job.output)?;
    let stats = penalize::penalize(&job.input, &job.zone_config, &job.output, &job.options)?;

    pipeline.run(&job.output)?;
    if let Some(missing) = pipeline
        .artifacts(&job.output)
        .into_iter()
        .find(|a| !a.exists())
    {
        return Err(Error::PipelineIntegrity(missing));
    }

    pipeline.restart()?;
    Ok(stats)
}
