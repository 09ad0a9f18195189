//! Fieldbus master collaborator.
//!
//! The master stack owns the wire protocol. The session, the exchange loop
//! and the health monitor only talk to it through [`FieldbusMaster`], which
//! allows testing against [`SimulatedMaster`](crate::SimulatedMaster)
//! without hardware.

use crate::slave::{AlStatus, SlaveInfo, SlaveState};
use iris_common::error::AcqResult;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Location of one node's process data inside the process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageRegion {
    /// Node position.
    pub position: u16,
    /// Byte offset of the node's inputs.
    pub input_offset: usize,
    /// Size of the node's inputs.
    pub input_size: usize,
    /// Byte offset of the node's outputs.
    pub output_offset: usize,
    /// Size of the node's outputs.
    pub output_size: usize,
}

/// Result of mapping the process image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageLayout {
    /// Total input image size in bytes.
    pub input_size: usize,
    /// Total output image size in bytes.
    pub output_size: usize,
    /// Working counter of a healthy exchange.
    pub expected_wkc: u16,
    /// Per-node regions, ordered by position.
    pub regions: Vec<ImageRegion>,
}

impl ImageLayout {
    /// Lay out nodes back to back in position order.
    ///
    /// Each node with outputs contributes 2 to the working counter (write
    /// and read), a node with inputs only contributes 1.
    pub fn packed(slaves: &[SlaveInfo]) -> Self {
        let mut layout = Self::default();
        for slave in slaves {
            layout.regions.push(ImageRegion {
                position: slave.position,
                input_offset: layout.input_size,
                input_size: slave.input_size,
                output_offset: layout.output_size,
                output_size: slave.output_size,
            });
            layout.input_size += slave.input_size;
            layout.output_size += slave.output_size;
            if slave.output_size > 0 {
                layout.expected_wkc += 2;
            }
            if slave.input_size > 0 {
                layout.expected_wkc += 1;
            }
        }
        layout
    }

    /// Region of the first node, where the IRIS device lives.
    pub fn first(&self) -> Option<&ImageRegion> {
        self.regions.first()
    }
}

/// Operations the acquisition server needs from a fieldbus master stack.
///
/// Timeouts are upper bounds for the call. None of the methods is expected
/// to block longer than its timeout.
pub trait FieldbusMaster: Send {
    /// Bind to the network adapter.
    fn open(&mut self, adapter: &str) -> AcqResult<()>;

    /// Enumerate responding nodes. An empty list means no node answered.
    fn enumerate_slaves(&mut self) -> AcqResult<Vec<SlaveInfo>>;

    /// Map the process image of all enumerated nodes.
    fn map_process_image(&mut self) -> AcqResult<ImageLayout>;

    /// Send outputs and receive inputs in one cycle; returns the working counter.
    fn exchange(&mut self, outputs: &[u8], inputs: &mut [u8], timeout: Duration)
        -> AcqResult<u16>;

    /// Request a state for every node.
    fn request_state(&mut self, state: SlaveState) -> AcqResult<()>;

    /// Wait up to `timeout` for every node to reach `target`; returns the
    /// lowest state observed.
    fn check_state(&mut self, target: SlaveState, timeout: Duration) -> AcqResult<SlaveState>;

    /// Re-read the status of every node, ordered by position.
    fn read_states(&mut self) -> AcqResult<Vec<AlStatus>>;

    /// Write a requested state to one node, optionally acknowledging its
    /// error indication.
    fn write_slave_state(&mut self, position: u16, state: SlaveState, acknowledge: bool)
        -> AcqResult<()>;

    /// Lightweight reconfiguration of one node; returns true on success.
    fn reconfigure_slave(&mut self, position: u16, timeout: Duration) -> AcqResult<bool>;

    /// Full recovery of a lost node; returns true on success.
    fn recover_slave(&mut self, position: u16, timeout: Duration) -> AcqResult<bool>;

    /// Re-check one node against `target`; returns its resulting status.
    fn check_slave_state(&mut self, position: u16, target: SlaveState, timeout: Duration)
        -> AcqResult<AlStatus>;

    /// Release the adapter.
    fn close(&mut self) -> AcqResult<()>;
}

/// Master handle shared between the session and its background loops.
pub type SharedMaster = Arc<Mutex<Box<dyn FieldbusMaster>>>;

/// Wrap a master for sharing between background loops.
pub fn shared(master: impl FieldbusMaster + 'static) -> SharedMaster {
    Arc::new(Mutex::new(Box::new(master)))
}
