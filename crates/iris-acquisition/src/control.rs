//! Job control surface.
//!
//! [`JobController`] owns the background measurement tasks, one per device,
//! and answers control requests with success/message/data triples. The
//! device row in the store stays the source of truth for "running".

use crate::acquisition::Acquisition;
use crate::score::ScoreModel;
use crate::search::{self, MeasurementQuery, ScoreTable};
use crate::sequencer::{JobContext, JobOutcome, JobReport, MeasurementSequencer};
use crate::storage::{stamped_name, SampleFileWriter};
use crate::store::{
    DeviceRecord, MeasureMode, MeasurementJob, MeasurementRecord, MeasurementStore,
    ReferenceChannel,
};
use chrono::Local;
use iris_common::config::ServiceConfig;
use iris_common::error::{AcqError, AcqResult};
use iris_common::sync::lock;
use iris_common::task::PeriodicTask;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

fn default_auto() -> bool {
    true
}

/// Parameters of a job start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Device serial number.
    pub sn: String,
    /// Reference channels scored on every cycle.
    #[serde(default)]
    pub refs: Vec<ReferenceChannel>,
    /// Automatic repetition.
    #[serde(default = "default_auto")]
    pub auto: bool,
    /// Pause between cycles, in seconds.
    #[serde(default)]
    pub interval: f64,
    /// Target number of cycles.
    pub repeat: u32,
    /// Tags copied onto every record.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl JobRequest {
    /// Automatic job of `repeat` back-to-back cycles without references.
    pub fn new(sn: impl Into<String>, repeat: u32) -> Self {
        Self {
            sn: sn.into(),
            refs: Vec::new(),
            auto: true,
            interval: 0.0,
            repeat,
            tags: Vec::new(),
        }
    }

    /// Set the pause between cycles.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.as_secs_f64();
        self
    }

    /// Set the reference channels.
    #[must_use]
    pub fn with_refs(mut self, refs: Vec<ReferenceChannel>) -> Self {
        self.refs = refs;
        self
    }

    /// Set the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    fn validate(&self) -> AcqResult<Duration> {
        if self.sn.is_empty() {
            return Err(AcqError::InvalidRequest("empty serial number".into()));
        }
        if self.repeat == 0 {
            return Err(AcqError::InvalidRequest("repeat must be at least 1".into()));
        }
        Duration::try_from_secs_f64(self.interval).map_err(|e| {
            AcqError::InvalidRequest(format!("invalid interval {}: {e}", self.interval))
        })
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A running job was stopped.
    Stopped,
    /// No job was running.
    AlreadyStopped,
}

impl StopOutcome {
    /// Caller-facing message for device `sn`.
    pub fn message(self, sn: &str) -> String {
        match self {
            Self::Stopped => format!("{sn} stopped"),
            Self::AlreadyStopped => format!("{sn} already stopped"),
        }
    }
}

/// Records of one job and whether its device is idle again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobScores {
    /// True once the device no longer runs a job.
    pub completed: bool,
    /// Records of the job in insertion order.
    pub records: Vec<MeasurementRecord>,
}

/// Caller-facing success/message/data triple.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponse<T> {
    /// Whether the request succeeded.
    pub success: bool,
    /// Human-readable detail, empty when there is nothing to add.
    pub message: String,
    /// Payload.
    pub data: Option<T>,
}

impl<T> ControlResponse<T> {
    /// Success carrying `data`.
    pub fn ok(data: T) -> Self {
        Self::ok_with_message(String::new(), data)
    }

    /// Success carrying `data` and a message.
    pub fn ok_with_message(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Failure described by `err`.
    pub fn fail(err: &AcqError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
        }
    }
}

/// Control request as received from a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Start a job.
    MeasureStart(JobRequest),
    /// Stop the job of a device.
    MeasureStop {
        /// Device serial number.
        sn: String,
    },
    /// Poll the records of a job.
    MeasureScore {
        /// Device serial number.
        sn: String,
        /// Job id returned by the start.
        #[serde(rename = "measureId")]
        measure_id: String,
    },
    /// List devices with their job status.
    DeviceMeasure,
    /// Per-device score table.
    Operation,
    /// Search measurements.
    Search(MeasurementQuery),
}

struct ActiveJob {
    job_id: String,
    task: PeriodicTask<MeasurementSequencer>,
}

/// Starts, stops and observes measurement jobs.
pub struct JobController {
    ctx: JobContext,
    period: Duration,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    finished: Mutex<HashMap<String, JobReport>>,
}

impl JobController {
    /// Create a controller ticking its sequencers every `period`.
    pub fn new(ctx: JobContext, period: Duration) -> Self {
        Self {
            ctx,
            period,
            jobs: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    /// Create a controller from the service configuration.
    pub fn from_config(
        acquisition: Arc<Acquisition>,
        store: Arc<dyn MeasurementStore>,
        scores: Arc<dyn ScoreModel>,
        config: &ServiceConfig,
    ) -> Self {
        let ctx = JobContext {
            acquisition,
            store,
            writer: SampleFileWriter::from_config(&config.storage),
            scores,
        };
        Self::new(ctx, config.acquisition.sequencer_period)
    }

    /// Shared collaborators.
    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Start a job for `request.sn` and return its job id.
    ///
    /// # Errors
    ///
    /// - [`AcqError::InvalidRequest`] for a zero repeat count or bad interval
    /// - [`AcqError::SessionClosed`] if the fieldbus loops are not running
    /// - [`AcqError::DeviceNotFound`] for an unknown device
    /// - [`AcqError::DuplicateJob`] if the device already runs a job
    /// - [`AcqError::AcquisitionBusy`] if another device's job holds the acquisition
    pub fn start_job(&self, request: JobRequest) -> AcqResult<String> {
        let interval = request.validate()?;
        if !self.ctx.acquisition.link().loops_running() {
            return Err(AcqError::SessionClosed);
        }

        let mut jobs = lock(&self.jobs);
        self.reap(&mut jobs);

        let device = self.ctx.store.device(&request.sn)?;
        if device.running || jobs.contains_key(&request.sn) {
            return Err(AcqError::DuplicateJob { sn: request.sn });
        }
        if let Some(active) = jobs.keys().next() {
            return Err(AcqError::AcquisitionBusy {
                active: active.clone(),
            });
        }

        let job = MeasurementJob {
            job_id: stamped_name(&request.sn, &Local::now()),
            sn: request.sn,
            refs: request.refs,
            mode: MeasureMode::from_auto(request.auto),
            interval,
            repeat: request.repeat,
            tags: request.tags,
        };
        self.ctx.store.set_job_started(&job.sn, &job)?;
        lock(&self.finished).remove(&job.sn);

        let sn = job.sn.clone();
        let job_id = job.job_id.clone();
        let repeat = job.repeat;
        let task = PeriodicTask::spawn(
            &format!("iris-measure-{sn}"),
            self.period,
            MeasurementSequencer::new(job, self.ctx.clone()),
        )
        .map_err(|e| {
            if let Err(stop_err) = self.ctx.store.set_job_stopped(&sn) {
                warn!(%sn, error = %stop_err, "Failed to mark device stopped");
            }
            e
        })?;

        info!(
            %sn,
            job = %job_id,
            repeat,
            interval_ms = interval.as_millis(),
            "Measurement job started"
        );
        jobs.insert(
            sn,
            ActiveJob {
                job_id: job_id.clone(),
                task,
            },
        );
        Ok(job_id)
    }

    /// Stop the job of `sn`, waiting for its task to exit.
    ///
    /// The in-progress cycle is discarded. A device row left running without
    /// a task is marked stopped.
    ///
    /// # Errors
    ///
    /// Returns [`AcqError::DeviceNotFound`] for an unknown device.
    pub fn stop_job(&self, sn: &str) -> AcqResult<StopOutcome> {
        let device = self.ctx.store.device(sn)?;
        // Held until the task has exited so no other job can claim the
        // acquisition before this one releases it
        let mut jobs = lock(&self.jobs);

        match jobs.remove(sn) {
            Some(active) if device.running => {
                let report = self.settle(sn, active, true);
                info!(sn, job = %report.job_id, recorded = report.recorded, "Measurement job stopped");
                Ok(StopOutcome::Stopped)
            }
            Some(active) => {
                self.settle(sn, active, false);
                Ok(StopOutcome::AlreadyStopped)
            }
            None if device.running => {
                warn!(sn, "Device marked running without a job task");
                self.ctx.store.set_job_stopped(sn)?;
                Ok(StopOutcome::Stopped)
            }
            None => Ok(StopOutcome::AlreadyStopped),
        }
    }

    /// Whether the device row is marked running.
    ///
    /// # Errors
    ///
    /// Returns [`AcqError::DeviceNotFound`] for an unknown device.
    pub fn is_job_running(&self, sn: &str) -> AcqResult<bool> {
        Ok(self.ctx.store.device(sn)?.running)
    }

    /// Records of job `job_id`.
    pub fn get_job_results(&self, job_id: &str) -> AcqResult<Vec<MeasurementRecord>> {
        self.ctx.store.measurements_for_job(job_id)
    }

    /// Records of `job_id` and whether device `sn` is idle again.
    pub fn job_scores(&self, sn: &str, job_id: &str) -> AcqResult<JobScores> {
        let completed = !self.is_job_running(sn)?;
        Ok(JobScores {
            completed,
            records: self.get_job_results(job_id)?,
        })
    }

    /// Wait until the job of `sn` ends on its own.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the job, or [`AcqError::InvalidRequest`]
    /// if the device never ran a job through this controller.
    pub fn wait_job(&self, sn: &str) -> AcqResult<JobReport> {
        // The job stays registered until its task has exited
        let settled = loop {
            {
                let mut jobs = lock(&self.jobs);
                let done = match jobs.get(sn) {
                    Some(active) => active.task.is_finished(),
                    None => break None,
                };
                if done {
                    break jobs.remove(sn).map(|active| self.settle(sn, active, false));
                }
            }
            thread::sleep(self.period);
        };
        let report = match settled {
            Some(report) => report,
            None => lock(&self.finished)
                .get(sn)
                .cloned()
                .ok_or_else(|| AcqError::InvalidRequest(format!("no job for {sn}")))?,
        };
        match report.outcome {
            JobOutcome::Failed(e) => Err(e),
            _ => Ok(report),
        }
    }

    /// Report of the last finished job of `sn`.
    pub fn last_report(&self, sn: &str) -> Option<JobReport> {
        let mut jobs = lock(&self.jobs);
        self.reap(&mut jobs);
        drop(jobs);
        lock(&self.finished).get(sn).cloned()
    }

    /// Every device row.
    pub fn devices(&self) -> AcqResult<Vec<DeviceRecord>> {
        self.ctx.store.devices()
    }

    /// Score history with one column per device.
    pub fn score_table(&self) -> AcqResult<ScoreTable> {
        Ok(ScoreTable::build(
            &self.ctx.store.devices()?,
            &self.ctx.store.measurements()?,
        ))
    }

    /// Records matching `query`.
    pub fn search(&self, query: &MeasurementQuery) -> AcqResult<Vec<MeasurementRecord>> {
        search::search(&self.ctx.store.measurements()?, query)
    }

    /// Stop every job. Returns the reports of the jobs that were active.
    pub fn shutdown(&self) -> Vec<JobReport> {
        let mut jobs = lock(&self.jobs);
        let active: Vec<(String, ActiveJob)> = jobs.drain().collect();
        active
            .into_iter()
            .map(|(sn, job)| self.settle(&sn, job, true))
            .collect()
    }

    /// Answer a client request.
    pub fn handle(&self, request: ControlRequest) -> ControlResponse<serde_json::Value> {
        let result = match request {
            ControlRequest::MeasureStart(request) => {
                let sn = request.sn.clone();
                self.start_job(request).map(|job_id| {
                    (
                        String::new(),
                        serde_json::json!({ "sn": sn, "measureId": job_id }),
                    )
                })
            }
            ControlRequest::MeasureStop { sn } => self
                .stop_job(&sn)
                .map(|outcome| (outcome.message(&sn), serde_json::Value::Null)),
            ControlRequest::MeasureScore { sn, measure_id } => {
                self.job_scores(&sn, &measure_id).and_then(|scores| {
                    let message = if scores.completed {
                        format!("{sn} completed")
                    } else {
                        String::new()
                    };
                    to_value(&scores.records).map(|data| (message, data))
                })
            }
            ControlRequest::DeviceMeasure => self
                .devices()
                .and_then(|d| to_value(&d))
                .map(|data| (String::new(), data)),
            ControlRequest::Operation => self
                .score_table()
                .and_then(|t| to_value(&t))
                .map(|data| (String::new(), data)),
            ControlRequest::Search(query) => self
                .search(&query)
                .and_then(|r| to_value(&r))
                .map(|data| (String::new(), data)),
        };

        match result {
            Ok((message, data)) => ControlResponse::ok_with_message(message, data),
            Err(e) => {
                warn!(error = %e, "Control request failed");
                ControlResponse::fail(&e)
            }
        }
    }

    /// Join tasks that have ended or are past marking their device stopped.
    fn reap(&self, jobs: &mut HashMap<String, ActiveJob>) {
        let done: Vec<String> = jobs
            .iter()
            .filter(|(sn, job)| job.task.is_finished() || !self.row_running(sn))
            .map(|(sn, _)| sn.clone())
            .collect();
        for sn in done {
            if let Some(job) = jobs.remove(&sn) {
                self.settle(&sn, job, false);
            }
        }
    }

    fn row_running(&self, sn: &str) -> bool {
        self.ctx.store.device(sn).map_or(false, |d| d.running)
    }

    fn settle(&self, sn: &str, active: ActiveJob, stop: bool) -> JobReport {
        let work = if stop {
            active.task.stop()
        } else {
            active.task.join()
        };

        let report = match work {
            Some(work) => work.report(),
            None => {
                error!(sn, job = %active.job_id, "Measurement task panicked");
                self.ctx.acquisition.stop();
                if let Err(e) = self.ctx.store.set_job_stopped(sn) {
                    warn!(sn, error = %e, "Failed to mark device stopped");
                }
                JobReport {
                    job_id: active.job_id,
                    sn: sn.to_string(),
                    recorded: 0,
                    outcome: JobOutcome::Failed(AcqError::Config(format!(
                        "measurement task for {sn} panicked"
                    ))),
                }
            }
        };
        lock(&self.finished).insert(sn.to_string(), report.clone());
        report
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn to_value<T: Serialize>(value: &T) -> AcqResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| AcqError::Persistence(format!("encode failed: {e}")))
}
