//! Per-cycle sample buffer and its file form.

use iris_common::error::{AcqError, AcqResult};
use iris_fieldbus::DATA_CHANNELS;
use std::fmt::Write as _;
use std::io::{self, Write};

/// Number of channel slots; slot 0 carries status and never holds data.
pub const CHANNEL_SLOTS: usize = 6;

/// Number of columns of a sample row.
pub const ROW_WIDTH: usize = 3;

/// Channel payloads of one collection cycle.
///
/// A slot is written at most once per cycle: the first payload to arrive
/// wins and later arrivals for the same channel are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleBuffer {
    slots: [Option<Vec<u8>>; CHANNEL_SLOTS],
}

impl SampleBuffer {
    /// Create a buffer with every slot empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` for `channel` if that slot is still empty.
    ///
    /// Returns true if the payload was stored. Channels outside `1..=5` and
    /// empty payloads are ignored.
    pub fn store(&mut self, channel: u8, payload: &[u8]) -> bool {
        if !DATA_CHANNELS.contains(&channel) || payload.is_empty() {
            return false;
        }
        let slot = &mut self.slots[usize::from(channel)];
        if slot.is_some() {
            return false;
        }
        *slot = Some(payload.to_vec());
        true
    }

    /// Payload stored for `channel`.
    pub fn channel(&self, channel: u8) -> Option<&[u8]> {
        self.slots.get(usize::from(channel))?.as_deref()
    }

    /// Number of populated data channels.
    pub fn populated(&self) -> usize {
        DATA_CHANNELS
            .filter(|c| self.slots[usize::from(*c)].is_some())
            .count()
    }

    /// Returns true when every data channel holds a payload.
    pub fn is_full(&self) -> bool {
        self.populated() == DATA_CHANNELS.count()
    }

    /// Total payload bytes over the data channels.
    pub fn payload_len(&self) -> usize {
        self.slots.iter().flatten().map(Vec::len).sum()
    }
}

/// Rows of byte triples written to a sample file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleMatrix {
    rows: Vec<[u8; ROW_WIDTH]>,
}

impl SampleMatrix {
    /// Concatenate channels 1..=5 in order and split into rows of three.
    ///
    /// # Errors
    ///
    /// Returns [`AcqError::Sample`] if the buffer is incomplete or the total
    /// payload length is not a multiple of three.
    pub fn from_buffer(buffer: &SampleBuffer) -> AcqResult<Self> {
        if !buffer.is_full() {
            return Err(AcqError::Sample(format!(
                "only {} of {} channels populated",
                buffer.populated(),
                DATA_CHANNELS.count()
            )));
        }

        let data: Vec<u8> = DATA_CHANNELS
            .filter_map(|c| buffer.channel(c))
            .flatten()
            .copied()
            .collect();
        if data.len() % ROW_WIDTH != 0 {
            return Err(AcqError::Sample(format!(
                "payload of {} bytes does not split into rows of {ROW_WIDTH}",
                data.len()
            )));
        }

        let rows = data
            .chunks_exact(ROW_WIDTH)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        Ok(Self { rows })
    }

    /// Rows in order.
    pub fn rows(&self) -> &[[u8; ROW_WIDTH]] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write tab-separated rows, one per line.
    ///
    /// # Errors
    ///
    /// Returns the writer's I/O error.
    pub fn write_to(&self, mut writer: impl Write) -> io::Result<()> {
        for [a, b, c] in &self.rows {
            writeln!(writer, "{a}\t{b}\t{c}")?;
        }
        writer.flush()
    }

    /// Render as file text.
    pub fn to_text(&self) -> String {
        let mut text = String::with_capacity(self.rows.len() * 12);
        for [a, b, c] in &self.rows {
            let _ = writeln!(text, "{a}\t{b}\t{c}");
        }
        text
    }
}
