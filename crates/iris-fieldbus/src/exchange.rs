//! Cyclic process data exchange.
//!
//! Every period the loop writes the current output pattern, exchanges the
//! process image with the bounded receive timeout and decodes the first
//! node's inputs into a [`ChannelFrame`] handed to the [`FrameSink`].

use crate::image::ProcessImage;
use crate::link::BusLink;
use crate::master::SharedMaster;
use iris_common::config::AcquisitionConfig;
use iris_common::error::AcqResult;
use iris_common::sync::lock;
use iris_common::task::Periodic;
use std::ops::{ControlFlow, RangeInclusive};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Channel indices carrying sample data.
pub const DATA_CHANNELS: RangeInclusive<u8> = 1..=5;

/// One decoded inbound frame: byte 0 is the status code, byte 1 the channel
/// index, the rest is payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFrame<'a> {
    /// Status code.
    pub code: u8,
    /// Channel index.
    pub index: u8,
    /// Payload bytes following the header.
    pub payload: &'a [u8],
}

impl<'a> ChannelFrame<'a> {
    /// Decode a frame from a node's input bytes. Returns `None` if the input
    /// is shorter than the two header bytes.
    pub fn decode(input: &'a [u8]) -> Option<Self> {
        match input {
            [code, index, payload @ ..] => Some(Self {
                code: *code,
                index: *index,
                payload,
            }),
            _ => None,
        }
    }
}

/// Meaning of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Payload for a data channel.
    Data {
        /// Channel index in `1..=5`.
        channel: u8,
    },
    /// The device finished sending a sample set.
    FullSignal,
    /// Anything else (idle device, unknown codes).
    Idle,
}

/// Status codes of the acquisition protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodes {
    /// Status code of a data frame.
    pub data_code: u8,
    /// Full-signal code.
    pub full_signal: u8,
}

impl Default for FrameCodes {
    fn default() -> Self {
        Self::from(&AcquisitionConfig::default())
    }
}

impl From<&AcquisitionConfig> for FrameCodes {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            data_code: config.data_code,
            full_signal: config.full_signal,
        }
    }
}

impl FrameCodes {
    /// Classify a frame.
    ///
    /// The full signal is accepted either as the channel index of a data
    /// frame or as the status code itself.
    pub fn classify(&self, frame: &ChannelFrame<'_>) -> FrameKind {
        if frame.code == self.data_code && DATA_CHANNELS.contains(&frame.index) {
            FrameKind::Data {
                channel: frame.index,
            }
        } else if (frame.code == self.data_code && frame.index == self.full_signal)
            || frame.code == self.full_signal
        {
            FrameKind::FullSignal
        } else {
            FrameKind::Idle
        }
    }
}

/// Consumer of decoded frames, called on the exchange thread once per cycle.
pub trait FrameSink: Send + Sync {
    /// Handle one decoded frame.
    fn on_frame(&self, frame: &ChannelFrame<'_>, kind: FrameKind);
}

/// Background work of the cyclic exchange.
pub struct ExchangeLoop {
    master: SharedMaster,
    link: Arc<BusLink>,
    image: ProcessImage,
    sink: Option<Arc<dyn FrameSink>>,
    codes: FrameCodes,
    receive_timeout: Duration,
    position: u16,
    degraded: bool,
}

impl ExchangeLoop {
    /// Create the exchange work for a mapped image. Frames are decoded from
    /// the node at `position`.
    pub fn new(
        master: SharedMaster,
        link: Arc<BusLink>,
        image: ProcessImage,
        position: u16,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            master,
            link,
            image,
            sink: None,
            codes: FrameCodes::default(),
            receive_timeout,
            position,
            degraded: false,
        }
    }

    /// Set the frame consumer.
    #[must_use]
    pub fn with_sink(mut self, sink: Option<Arc<dyn FrameSink>>, codes: FrameCodes) -> Self {
        self.sink = sink;
        self.codes = codes;
        self
    }

    /// Run one exchange cycle and return the working counter.
    ///
    /// # Errors
    ///
    /// Returns the master's error if the exchange failed.
    pub fn cycle(&mut self) -> AcqResult<u16> {
        self.link
            .copy_outputs_into(self.image.slave_outputs_mut(self.position));

        let started = Instant::now();
        let wkc = {
            let mut master = lock(&self.master);
            let (outputs, inputs) = self.image.exchange_buffers();
            master.exchange(outputs, inputs, self.receive_timeout)?
        };
        let rtt_us = u32::try_from(started.elapsed().as_micros()).unwrap_or(u32::MAX);

        self.image.set_last_wkc(wkc);
        self.link.set_actual_wkc(wkc);
        let degraded = self.image.wkc_deficit();
        self.link
            .update_stats(|stats| stats.record_exchange(rtt_us, degraded));
        self.log_degraded(degraded, wkc);

        let inputs = self.image.slave_inputs(self.position);
        self.link.store_inputs(inputs);
        if let (Some(sink), Some(frame)) = (&self.sink, ChannelFrame::decode(inputs)) {
            sink.on_frame(&frame, self.codes.classify(&frame));
        }

        Ok(wkc)
    }

    fn log_degraded(&mut self, degraded: bool, wkc: u16) {
        let expected = self.image.expected_wkc();
        match (self.degraded, degraded) {
            (false, true) => warn!(wkc, expected, "Degraded exchange: working counter below expected"),
            (true, true) => debug!(wkc, expected, "Exchange still degraded"),
            (true, false) => info!(wkc, "Working counter restored"),
            (false, false) => {}
        }
        self.degraded = degraded;
    }
}

impl Periodic for ExchangeLoop {
    fn tick(&mut self) -> ControlFlow<()> {
        if let Err(e) = self.cycle() {
            // A failed receive counts as no node answering
            self.image.set_last_wkc(0);
            self.link.set_actual_wkc(0);
            self.link.update_stats(|stats| stats.record_failure());
            warn!(error = %e, "Process data exchange failed");
            self.degraded = true;
        }
        ControlFlow::Continue(())
    }

    fn finish(&mut self) {
        self.link.set_exchange_running(false);
    }
}
