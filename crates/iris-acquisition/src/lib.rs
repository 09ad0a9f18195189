//! Measurement layer of the IRIS acquisition server.
//!
//! - [`Acquisition`] turns decoded channel frames into a complete sample set
//! - [`MeasurementSequencer`] repeats collection cycles for one job
//! - [`JobController`] starts, stops and observes jobs
//! - [`MeasurementStore`] and [`SampleFileWriter`] persist the results

pub mod acquisition;
pub mod control;
pub mod sample;
pub mod score;
pub mod search;
pub mod sequencer;
pub mod storage;
pub mod store;

pub use acquisition::{Acquisition, CompletedSample};
pub use control::{
    ControlRequest, ControlResponse, JobController, JobRequest, JobScores, StopOutcome,
};
pub use sample::{SampleBuffer, SampleMatrix, CHANNEL_SLOTS, ROW_WIDTH};
pub use score::{FixedScore, ScoreModel, SyntheticScores};
pub use search::{search, MeasurementQuery, ScoreTable, QUERY_TIMESTAMP};
pub use sequencer::{JobContext, JobOutcome, JobReport, MeasurementSequencer};
pub use storage::{sample_file_name, stamped_name, SampleFileWriter, COMPACT_TIMESTAMP};
pub use store::{
    DeviceRecord, EquipmentScore, MeasureMode, MeasurementJob, MeasurementRecord,
    MeasurementStore, MemoryStore, ReferenceChannel, ReferenceScore,
};
