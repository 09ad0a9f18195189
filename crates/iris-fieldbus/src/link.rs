//! State shared between the session, its background loops and the
//! acquisition layer.
//!
//! Every field has a single writer: the exchange loop owns the working
//! counters, inputs and statistics; the acquisition owns the output pattern;
//! the session and the loops own their running flags.

use crate::image::ExchangeStats;
use iris_common::sync::lock;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;

/// Shared view of an open fieldbus session.
#[derive(Debug, Default)]
pub struct BusLink {
    outputs: Mutex<Vec<u8>>,
    inputs: Mutex<Vec<u8>>,
    stats: Mutex<ExchangeStats>,
    exchange_running: AtomicBool,
    health_running: AtomicBool,
    in_op: AtomicBool,
    check_requested: AtomicBool,
    actual_wkc: AtomicU16,
    expected_wkc: AtomicU16,
}

impl BusLink {
    /// Create a link with no background loop running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the output pattern of the first node and clear it.
    pub fn reset_outputs(&self, size: usize) {
        let mut outputs = lock(&self.outputs);
        outputs.clear();
        outputs.resize(size, 0);
    }

    /// Replace the output pattern of the first node: all zero except the
    /// given leading bytes.
    pub fn write_outputs(&self, pattern: &[u8]) {
        let mut outputs = lock(&self.outputs);
        outputs.fill(0);
        let n = pattern.len().min(outputs.len());
        outputs[..n].copy_from_slice(&pattern[..n]);
    }

    /// Copy of the current output pattern.
    pub fn outputs(&self) -> Vec<u8> {
        lock(&self.outputs).clone()
    }

    /// Copy the output pattern into `dest`.
    pub(crate) fn copy_outputs_into(&self, dest: &mut [u8]) {
        let outputs = lock(&self.outputs);
        let n = outputs.len().min(dest.len());
        dest[..n].copy_from_slice(&outputs[..n]);
    }

    /// Copy of the first node's inputs from the last exchange.
    pub fn inputs(&self) -> Vec<u8> {
        lock(&self.inputs).clone()
    }

    pub(crate) fn store_inputs(&self, inputs: &[u8]) {
        let mut stored = lock(&self.inputs);
        stored.clear();
        stored.extend_from_slice(inputs);
    }

    /// Snapshot of the exchange statistics.
    pub fn stats(&self) -> ExchangeStats {
        *lock(&self.stats)
    }

    pub(crate) fn update_stats(&self, f: impl FnOnce(&mut ExchangeStats)) {
        f(&mut lock(&self.stats));
    }

    /// Returns true while both the exchange loop and the health monitor run.
    pub fn loops_running(&self) -> bool {
        self.exchange_running.load(Ordering::Acquire) && self.health_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_exchange_running(&self, running: bool) {
        self.exchange_running.store(running, Ordering::Release);
    }

    pub(crate) fn set_health_running(&self, running: bool) {
        self.health_running.store(running, Ordering::Release);
    }

    /// Mark both loops as running without a session, for driving an
    /// acquisition directly in tests.
    #[cfg(feature = "simulated")]
    pub fn simulate_loops(&self, running: bool) {
        self.set_exchange_running(running);
        self.set_health_running(running);
    }

    /// Returns true once the network was put into operation.
    pub fn in_op(&self) -> bool {
        self.in_op.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_op(&self, in_op: bool) {
        self.in_op.store(in_op, Ordering::Release);
    }

    /// Ask the health monitor to re-check slave states.
    pub fn request_check(&self) {
        self.check_requested.store(true, Ordering::Release);
    }

    /// Returns true while a re-check is pending.
    pub fn check_requested(&self) -> bool {
        self.check_requested.load(Ordering::Acquire)
    }

    pub(crate) fn take_check_request(&self) -> bool {
        self.check_requested.swap(false, Ordering::AcqRel)
    }

    /// Record the working counter of the last exchange.
    pub(crate) fn set_actual_wkc(&self, wkc: u16) {
        self.actual_wkc.store(wkc, Ordering::Release);
    }

    pub(crate) fn set_expected_wkc(&self, wkc: u16) {
        self.expected_wkc.store(wkc, Ordering::Release);
    }

    /// Working counter of the last exchange.
    pub fn actual_wkc(&self) -> u16 {
        self.actual_wkc.load(Ordering::Acquire)
    }

    /// Working counter of a healthy exchange.
    pub fn expected_wkc(&self) -> u16 {
        self.expected_wkc.load(Ordering::Acquire)
    }

    /// Returns true when the last exchange saw fewer nodes than expected.
    pub fn wkc_deficit(&self) -> bool {
        self.actual_wkc() < self.expected_wkc()
    }
}
