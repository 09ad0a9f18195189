//! End-to-end scenarios on a simulated fieldbus.
//!
//! Every scenario opens a real session, wires the acquisition and job
//! controller to it and observes the result through the control surface,
//! the persistence collaborator and the sample directory.

mod common;
mod job_test;
mod recovery_test;
