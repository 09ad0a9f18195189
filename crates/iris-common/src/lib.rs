#![doc = "Common types shared across the IRIS acquisition workspace."]

pub mod config;
pub mod error;
pub mod state;
pub mod sync;
pub mod task;

pub use config::*;
pub use error::*;
pub use state::*;
pub use task::*;
