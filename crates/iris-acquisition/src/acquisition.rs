//! Acquisition state machine.
//!
//! The exchange loop reaches the acquisition only through [`FrameSink`] and
//! drives COLLECTING → FULL. The sequencer reaches it only through
//! [`Acquisition::start`], [`Acquisition::stop`], [`Acquisition::state`] and
//! [`Acquisition::take_completed`] and drives STOPPED ↔ COLLECTING.

use crate::sample::SampleBuffer;
use crate::storage::sample_file_name;
use chrono::Local;
use iris_common::config::AcquisitionConfig;
use iris_common::state::AcquisitionState;
use iris_common::sync::lock;
use iris_fieldbus::{BusLink, ChannelFrame, FrameKind, FrameSink};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Default)]
struct Cycle {
    state: AcquisitionState,
    buffer: SampleBuffer,
    file_name: Option<String>,
}

/// A completed cycle handed to the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSample {
    /// Destination file name allocated at start.
    pub file_name: String,
    /// Channel payloads.
    pub buffer: SampleBuffer,
}

/// Collection cycle bound to the output pattern of the first node.
#[derive(Debug)]
pub struct Acquisition {
    link: Arc<BusLink>,
    start_command: u8,
    cycle: Mutex<Cycle>,
}

impl Acquisition {
    /// Create a stopped acquisition writing its output pattern to `link`.
    pub fn new(link: Arc<BusLink>, config: &AcquisitionConfig) -> Self {
        Self {
            link,
            start_command: config.start_command,
            cycle: Mutex::new(Cycle::default()),
        }
    }

    /// Link the output pattern is written to.
    pub fn link(&self) -> &Arc<BusLink> {
        &self.link
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        lock(&self.cycle).state
    }

    /// File name allocated for the current cycle.
    pub fn file_name(&self) -> Option<String> {
        lock(&self.cycle).file_name.clone()
    }

    /// Number of data channels received in the current cycle.
    pub fn populated_channels(&self) -> usize {
        lock(&self.cycle).buffer.populated()
    }

    /// Begin a collection cycle for device `sn`.
    ///
    /// No-op unless the acquisition is stopped and both background loops
    /// run. Returns true if a cycle started.
    pub fn start(&self, sn: &str) -> bool {
        let mut cycle = lock(&self.cycle);
        if cycle.state != AcquisitionState::Stopped || !self.link.loops_running() {
            trace!(state = %cycle.state, "Start ignored");
            return false;
        }

        cycle.buffer = SampleBuffer::new();
        let file_name = sample_file_name(sn, &Local::now());
        self.link.write_outputs(&[0, self.start_command]);
        if let Err(e) = cycle.state.transition_to(AcquisitionState::Collecting) {
            warn!(error = %e, "Unexpected acquisition state");
            return false;
        }
        debug!(sn, file = %file_name, "Collection started");
        cycle.file_name = Some(file_name);
        true
    }

    /// Abandon or finish the current cycle and clear the output pattern.
    ///
    /// No-op when already stopped. Returns true if the state changed.
    pub fn stop(&self) -> bool {
        let mut cycle = lock(&self.cycle);
        if cycle.state == AcquisitionState::Stopped {
            return false;
        }

        self.link.write_outputs(&[]);
        let from = cycle.state;
        cycle.state = AcquisitionState::Stopped;
        cycle.file_name = None;
        debug!(%from, "Collection stopped");
        true
    }

    /// Take the buffer of a FULL cycle, leaving an empty one behind.
    ///
    /// The state stays FULL until [`stop`](Self::stop).
    pub fn take_completed(&self) -> Option<CompletedSample> {
        let mut cycle = lock(&self.cycle);
        if cycle.state != AcquisitionState::Full {
            return None;
        }
        let file_name = cycle.file_name.take()?;
        Some(CompletedSample {
            file_name,
            buffer: std::mem::take(&mut cycle.buffer),
        })
    }
}

impl FrameSink for Acquisition {
    fn on_frame(&self, frame: &ChannelFrame<'_>, kind: FrameKind) {
        let mut cycle = lock(&self.cycle);
        if cycle.state != AcquisitionState::Collecting {
            return;
        }

        match kind {
            FrameKind::Data { channel } => {
                if cycle.buffer.store(channel, frame.payload) {
                    trace!(channel, bytes = frame.payload.len(), "Channel stored");
                }
            }
            FrameKind::FullSignal if cycle.buffer.is_full() => {
                if cycle.state.transition_to(AcquisitionState::Full).is_ok() {
                    info!(
                        file = cycle.file_name.as_deref().unwrap_or_default(),
                        bytes = cycle.buffer.payload_len(),
                        "Sample set complete"
                    );
                }
            }
            FrameKind::FullSignal | FrameKind::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_fieldbus::FrameCodes;

    fn acquisition() -> Acquisition {
        let link = Arc::new(BusLink::new());
        link.reset_outputs(8);
        link.simulate_loops(true);
        Acquisition::new(link, &AcquisitionConfig::default())
    }

    fn feed(acq: &Acquisition, bytes: &[u8]) {
        let frame = ChannelFrame::decode(bytes).unwrap();
        acq.on_frame(&frame, FrameCodes::default().classify(&frame));
    }

    #[test]
    fn test_start_requires_running_loops() {
        let acq = acquisition();
        acq.link().simulate_loops(false);
        assert!(!acq.start("1001"));
        assert_eq!(acq.state(), AcquisitionState::Stopped);
        assert_eq!(acq.link().outputs(), vec![0; 8]);
    }

    #[test]
    fn test_start_writes_pattern_and_allocates_name() {
        let acq = acquisition();
        assert!(acq.start("1001"));
        assert_eq!(acq.state(), AcquisitionState::Collecting);
        assert_eq!(acq.link().outputs(), vec![0, 11, 0, 0, 0, 0, 0, 0]);

        let name = acq.file_name().unwrap();
        assert!(name.starts_with("1001_"));
        assert!(name.ends_with(".txt"));
        assert_eq!(name.len(), "1001_".len() + 14 + ".txt".len());

        // Second start is a no-op
        assert!(!acq.start("1001"));
    }

    #[test]
    fn test_frames_ignored_unless_collecting() {
        let acq = acquisition();
        feed(&acq, &[22, 1, 1, 2, 3]);
        assert_eq!(acq.populated_channels(), 0);
    }

    #[test]
    fn test_full_after_all_channels_and_signal() {
        let acq = acquisition();
        acq.start("1001");

        for channel in [3, 1, 5, 2] {
            feed(&acq, &[22, channel, channel, 0, 0]);
        }
        feed(&acq, &[22, 33]);
        assert_eq!(acq.state(), AcquisitionState::Collecting, "full signal before channel 4");

        feed(&acq, &[22, 4, 4, 0, 0]);
        assert_eq!(acq.state(), AcquisitionState::Collecting, "complete but no signal yet");

        feed(&acq, &[22, 33]);
        assert_eq!(acq.state(), AcquisitionState::Full);

        let done = acq.take_completed().unwrap();
        assert!(done.buffer.is_full());
        assert!(done.file_name.starts_with("1001_"));
        assert!(acq.take_completed().is_none());
        assert_eq!(acq.state(), AcquisitionState::Full);

        assert!(acq.stop());
        assert_eq!(acq.state(), AcquisitionState::Stopped);
        assert_eq!(acq.link().outputs(), vec![0; 8]);
    }

    #[test]
    fn test_status_code_full_signal() {
        let acq = acquisition();
        acq.start("1001");
        for channel in 1..=5 {
            feed(&acq, &[22, channel, 9, 9, 9]);
        }
        feed(&acq, &[33, 0]);
        assert_eq!(acq.state(), AcquisitionState::Full);
    }

    #[test]
    fn test_stop_while_collecting_discards_cycle() {
        let acq = acquisition();
        acq.start("1001");
        feed(&acq, &[22, 1, 1, 1, 1]);

        assert!(acq.stop());
        assert!(!acq.stop());
        assert!(acq.take_completed().is_none());

        // New cycle starts from an empty buffer
        assert!(acq.start("1001"));
        assert_eq!(acq.populated_channels(), 0);
    }
}
