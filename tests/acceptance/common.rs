//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Opening a complete service on a simulated master
//! - Waiting on asynchronous conditions with a deadline
//! - Inspecting the sample directory

#![allow(dead_code)] // Not every scenario uses every helper

use iris_acquisition::{
    Acquisition, FixedScore, JobController, MeasurementStore, MemoryStore, ScoreModel,
};
use iris_common::config::ServiceConfig;
use iris_common::error::AcqResult;
use iris_fieldbus::{
    BusLink, FieldbusSession, FrameCodes, FrameSink, SessionBuilder, SimulatedMaster,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default deadline of [`wait_for`].
pub const DEADLINE: Duration = Duration::from_secs(5);

/// Service configuration with millisecond loops writing under `base_dir`.
pub fn fast_config(base_dir: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.fieldbus.adapter = Some("sim0".into());
    config.fieldbus.exchange_period = Duration::from_millis(1);
    config.fieldbus.health_period = Duration::from_millis(1);
    config.fieldbus.op_check_attempts = 5;
    config.acquisition.sequencer_period = Duration::from_millis(1);
    config.storage.base_dir = base_dir.join("samples");
    config
}

/// A running service. Fields drop in order: jobs stop before the session.
pub struct ServiceRig {
    pub controller: JobController,
    pub acquisition: Arc<Acquisition>,
    pub session: Option<FieldbusSession>,
    pub store: Arc<MemoryStore>,
    pub sim: SimulatedMaster,
    pub config: ServiceConfig,
    pub dir: tempfile::TempDir,
}

/// Builder for [`ServiceRig`].
pub struct RigBuilder {
    sim: Option<SimulatedMaster>,
    devices: Vec<String>,
    scores: Arc<dyn ScoreModel>,
}

impl Default for RigBuilder {
    fn default() -> Self {
        Self {
            sim: None,
            devices: vec!["1001".into(), "1002".into()],
            scores: Arc::new(FixedScore(70)),
        }
    }
}

impl RigBuilder {
    /// Use a prepared simulated master instead of the default IRIS node.
    pub fn master(mut self, sim: SimulatedMaster) -> Self {
        self.sim = Some(sim);
        self
    }

    /// Score model of the controller.
    pub fn scores(mut self, scores: Arc<dyn ScoreModel>) -> Self {
        self.scores = scores;
        self
    }

    /// Open the session and build the controller.
    pub fn open(self) -> AcqResult<ServiceRig> {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = fast_config(dir.path());
        let sim = self
            .sim
            .unwrap_or_else(|| SimulatedMaster::with_iris_codes(&config.acquisition));

        let link = Arc::new(BusLink::new());
        let acquisition = Arc::new(Acquisition::new(Arc::clone(&link), &config.acquisition));
        let session = SessionBuilder::new(&config.fieldbus)
            .codes(FrameCodes::from(&config.acquisition))
            .link(link)
            .sink(Arc::clone(&acquisition) as Arc<dyn FrameSink>)
            .open(sim.clone())?;

        let store = Arc::new(MemoryStore::with_devices(self.devices));
        let controller = JobController::from_config(
            Arc::clone(&acquisition),
            Arc::clone(&store) as Arc<dyn MeasurementStore>,
            self.scores,
            &config,
        );

        Ok(ServiceRig {
            controller,
            acquisition,
            session: Some(session),
            store,
            sim,
            config,
            dir,
        })
    }
}

impl ServiceRig {
    /// Builder with two registered devices and a fixed score of 70.
    pub fn builder() -> RigBuilder {
        RigBuilder::default()
    }

    /// Open with defaults.
    pub fn open() -> ServiceRig {
        Self::builder().open().expect("service should open")
    }

    /// The open session.
    pub fn session(&self) -> &FieldbusSession {
        self.session.as_ref().expect("session open")
    }

    /// Stop every job and close the session.
    pub fn close(mut self) -> AcqResult<()> {
        self.controller.shutdown();
        match self.session.take() {
            Some(session) => session.close().map(|_| ()),
            None => Ok(()),
        }
    }

    /// Sample files written so far.
    pub fn sample_files(&self) -> Vec<PathBuf> {
        sample_files(&self.config.storage.base_dir)
    }

    /// Wait until device `sn` no longer runs a job.
    pub fn wait_idle(&self, sn: &str) -> bool {
        wait_for(|| !self.controller.is_job_running(sn).unwrap_or(true))
    }
}

/// Files directly under `dir`; empty if the directory does not exist.
pub fn sample_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(_) => Vec::new(),
    }
}

/// Poll `condition` until it holds or [`DEADLINE`] passes.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
