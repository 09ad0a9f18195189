//! Process image buffers and exchange statistics.

use crate::master::{ImageLayout, ImageRegion};
use serde::Serialize;

/// Process data buffers for one exchange cycle.
#[derive(Debug, Clone, Default)]
pub struct ProcessImage {
    /// Input data (slave → master).
    inputs: Vec<u8>,
    /// Output data (master → slave).
    outputs: Vec<u8>,
    /// Per-node regions.
    regions: Vec<ImageRegion>,
    /// Expected working counter.
    expected_wkc: u16,
    /// Last received working counter.
    last_wkc: u16,
}

impl ProcessImage {
    /// Allocate buffers for a mapped layout.
    pub fn new(layout: &ImageLayout) -> Self {
        Self {
            inputs: vec![0; layout.input_size],
            outputs: vec![0; layout.output_size],
            regions: layout.regions.clone(),
            expected_wkc: layout.expected_wkc,
            last_wkc: 0,
        }
    }

    /// Get the input buffer.
    pub fn inputs(&self) -> &[u8] {
        &self.inputs
    }

    /// Get the output buffer.
    pub fn outputs(&self) -> &[u8] {
        &self.outputs
    }

    /// Get both buffers for an exchange.
    ///
    /// Returns (outputs, inputs_mut) so both can be borrowed at once.
    pub fn exchange_buffers(&mut self) -> (&[u8], &mut [u8]) {
        (&self.outputs, &mut self.inputs)
    }

    /// Inputs of the node at `position`.
    pub fn slave_inputs(&self, position: u16) -> &[u8] {
        self.region(position)
            .and_then(|r| self.inputs.get(r.input_offset..r.input_offset + r.input_size))
            .unwrap_or(&[])
    }

    /// Outputs of the node at `position`, mutably.
    pub fn slave_outputs_mut(&mut self, position: u16) -> &mut [u8] {
        match self.region(position).copied() {
            Some(r) => self
                .outputs
                .get_mut(r.output_offset..r.output_offset + r.output_size)
                .unwrap_or(&mut []),
            None => &mut [],
        }
    }

    /// Output size of the node at `position`.
    pub fn slave_output_size(&self, position: u16) -> usize {
        self.region(position).map_or(0, |r| r.output_size)
    }

    fn region(&self, position: u16) -> Option<&ImageRegion> {
        self.regions.iter().find(|r| r.position == position)
    }

    /// Expected working counter.
    pub fn expected_wkc(&self) -> u16 {
        self.expected_wkc
    }

    /// Last received working counter.
    pub fn last_wkc(&self) -> u16 {
        self.last_wkc
    }

    /// Update the last working counter.
    pub fn set_last_wkc(&mut self, wkc: u16) {
        self.last_wkc = wkc;
    }

    /// Returns true when fewer nodes answered than expected.
    pub fn wkc_deficit(&self) -> bool {
        self.last_wkc < self.expected_wkc
    }
}

/// Process data exchange statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExchangeStats {
    /// Exchanges that returned a working counter.
    pub exchanges: u64,
    /// Exchanges whose working counter was below the expected value.
    pub wkc_errors: u64,
    /// Exchanges that failed outright (timeout, adapter error).
    pub failures: u64,
    /// Last round-trip time in microseconds.
    pub last_rtt_us: u32,
    /// Minimum round-trip time.
    pub min_rtt_us: u32,
    /// Maximum round-trip time.
    pub max_rtt_us: u32,
}

impl ExchangeStats {
    /// Record a completed exchange.
    pub fn record_exchange(&mut self, rtt_us: u32, degraded: bool) {
        self.exchanges += 1;
        if degraded {
            self.wkc_errors += 1;
        }
        self.last_rtt_us = rtt_us;
        if self.min_rtt_us == 0 || rtt_us < self.min_rtt_us {
            self.min_rtt_us = rtt_us;
        }
        if rtt_us > self.max_rtt_us {
            self.max_rtt_us = rtt_us;
        }
    }

    /// Record a failed exchange.
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }
}
