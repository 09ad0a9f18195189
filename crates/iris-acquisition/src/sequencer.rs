//! Measurement sequencing: one job, many collection cycles.

use crate::acquisition::Acquisition;
use crate::sample::SampleMatrix;
use crate::score::ScoreModel;
use crate::storage::SampleFileWriter;
use crate::store::{MeasurementJob, MeasurementRecord, MeasurementStore};
use chrono::Local;
use iris_common::error::AcqError;
use iris_common::error::AcqResult;
use iris_common::state::AcquisitionState;
use iris_common::task::Periodic;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every job.
#[derive(Clone)]
pub struct JobContext {
    /// Acquisition driven by the job.
    pub acquisition: Arc<Acquisition>,
    /// Persistence collaborator.
    pub store: Arc<dyn MeasurementStore>,
    /// Sample file storage.
    pub writer: SampleFileWriter,
    /// Score model.
    pub scores: Arc<dyn ScoreModel>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The target repeat count was reached.
    Completed,
    /// Stopped on request before completion.
    Stopped,
    /// Aborted by an error.
    Failed(AcqError),
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Summary of a finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    /// Job id.
    pub job_id: String,
    /// Device serial number.
    pub sn: String,
    /// Records persisted by the job.
    pub recorded: u32,
    /// How the job ended.
    pub outcome: JobOutcome,
}

/// Background work driving one job.
pub struct MeasurementSequencer {
    job: MeasurementJob,
    ctx: JobContext,
    next_start: Instant,
    recorded: u32,
    outcome: Option<JobOutcome>,
}

impl MeasurementSequencer {
    /// Create the work for `job`. The first cycle starts on the first tick.
    pub fn new(job: MeasurementJob, ctx: JobContext) -> Self {
        Self {
            job,
            ctx,
            next_start: Instant::now(),
            recorded: 0,
            outcome: None,
        }
    }

    /// The job being run.
    pub fn job(&self) -> &MeasurementJob {
        &self.job
    }

    /// Report of the job so far; a job without outcome counts as stopped.
    pub fn report(&self) -> JobReport {
        JobReport {
            job_id: self.job.job_id.clone(),
            sn: self.job.sn.clone(),
            recorded: self.recorded,
            outcome: self.outcome.clone().unwrap_or(JobOutcome::Stopped),
        }
    }

    /// Persist a FULL cycle. Returns false once the target count is reached.
    fn complete_cycle(&mut self) -> AcqResult<bool> {
        let Some(done) = self.ctx.acquisition.take_completed() else {
            return Ok(true);
        };

        let matrix = SampleMatrix::from_buffer(&done.buffer)?;
        self.ctx.writer.write(&done.file_name, &matrix)?;

        let device = self.ctx.store.device(&self.job.sn)?;
        let record = MeasurementRecord {
            id: 0,
            job_id: self.job.job_id.clone(),
            sn: self.job.sn.clone(),
            timestamp: Local::now(),
            file_name: done.file_name,
            score: self.ctx.scores.score(&self.job.refs, &matrix),
            tags: self.job.tags.clone(),
        };
        self.ctx.store.insert_measurement(record)?;
        let count = self.ctx.store.increment_count(&self.job.sn)?;
        self.recorded += 1;
        info!(
            job = %self.job.job_id,
            count,
            repeat = device.repeat,
            rows = matrix.len(),
            "Measurement recorded"
        );

        self.ctx.acquisition.stop();
        self.next_start = Instant::now() + self.job.interval;
        Ok(count < device.repeat)
    }
}

impl Periodic for MeasurementSequencer {
    fn tick(&mut self) -> ControlFlow<()> {
        match self.ctx.acquisition.state() {
            AcquisitionState::Stopped => {
                if Instant::now() >= self.next_start && !self.ctx.acquisition.start(&self.job.sn) {
                    debug!(job = %self.job.job_id, "Fieldbus loops not running, start deferred");
                }
                ControlFlow::Continue(())
            }
            AcquisitionState::Collecting => ControlFlow::Continue(()),
            AcquisitionState::Full => match self.complete_cycle() {
                Ok(true) => ControlFlow::Continue(()),
                Ok(false) => {
                    self.outcome = Some(JobOutcome::Completed);
                    ControlFlow::Break(())
                }
                Err(e) => {
                    error!(job = %self.job.job_id, error = %e, "Measurement job aborted");
                    self.outcome = Some(JobOutcome::Failed(e));
                    ControlFlow::Break(())
                }
            },
        }
    }

    fn finish(&mut self) {
        self.ctx.acquisition.stop();
        if let Err(e) = self.ctx.store.set_job_stopped(&self.job.sn) {
            warn!(sn = %self.job.sn, error = %e, "Failed to mark device stopped");
        }
        let outcome = self.outcome.get_or_insert(JobOutcome::Stopped);
        info!(
            job = %self.job.job_id,
            recorded = self.recorded,
            %outcome,
            "Measurement job finished"
        );
    }
}
