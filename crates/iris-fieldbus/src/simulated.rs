//! Simulated fieldbus master for testing without hardware.
//!
//! [`SimulatedMaster`] is a cheap handle over shared bus state: tests keep a
//! clone to script faults and inspect calls after the session took ownership
//! of the master.

use crate::master::{FieldbusMaster, ImageLayout};
use crate::slave::{AlStatus, SlaveIdentity, SlaveInfo, SlaveState};
use iris_common::config::{AcquisitionConfig, SlaveSpec};
use iris_common::error::{AcqError, AcqResult};
use iris_common::sync::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Input size of the simulated IRIS node: a code byte, an index byte and
/// ten 3-byte samples.
pub const IRIS_INPUT_SIZE: usize = 32;

/// Output size of the simulated IRIS node.
pub const IRIS_OUTPUT_SIZE: usize = 8;

/// Master operation recorded by the simulation (process data exchanges are
/// counted, not recorded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterCall {
    /// `open(adapter)`.
    Open(String),
    /// `enumerate_slaves()`.
    Enumerate,
    /// `map_process_image()`.
    Map,
    /// `request_state(state)`.
    RequestState(SlaveState),
    /// `check_state(target)`.
    CheckState(SlaveState),
    /// `read_states()`.
    ReadStates,
    /// `write_slave_state(position, state, acknowledge)`.
    WriteSlaveState {
        /// Node position.
        position: u16,
        /// Requested state.
        state: SlaveState,
        /// Error acknowledge flag.
        acknowledge: bool,
    },
    /// `reconfigure_slave(position)`.
    Reconfigure(u16),
    /// `recover_slave(position)`.
    Recover(u16),
    /// `check_slave_state(position, target)`.
    CheckSlaveState(u16, SlaveState),
    /// `close()`.
    Close,
}

#[derive(Debug)]
struct SimNode {
    info: SlaveInfo,
    status: AlStatus,
    reconfigure_ok: bool,
    recover_ok: bool,
}

/// Emulates the IRIS sensor: while the start command is present in output
/// byte 1 it streams channels 1..=5 followed by a full-signal frame, over
/// and over.
#[derive(Debug)]
struct SensorEmulation {
    data_code: u8,
    full_signal: u8,
    start_command: u8,
    step: u8,
    cycle: u8,
}

impl SensorEmulation {
    fn next_frame(&mut self, outputs: &[u8], frame: &mut [u8]) {
        frame.fill(0);
        if outputs.get(1) != Some(&self.start_command) {
            self.step = 0;
            return;
        }
        if frame.len() < 2 {
            return;
        }

        frame[0] = self.data_code;
        if self.step < 5 {
            let channel = self.step + 1;
            frame[1] = channel;
            for (i, byte) in frame[2..].iter_mut().enumerate() {
                *byte = self
                    .cycle
                    .wrapping_add(channel.wrapping_mul(16))
                    .wrapping_add(i as u8);
            }
            self.step += 1;
        } else {
            frame[1] = self.full_signal;
            self.step = 0;
            self.cycle = self.cycle.wrapping_add(1);
        }
    }
}

#[derive(Debug, Default)]
struct SimBus {
    adapter: Option<String>,
    nodes: Vec<SimNode>,
    layout: ImageLayout,
    block_safe_op: bool,
    block_op: bool,
    fail_exchange: bool,
    wkc_deficit: u16,
    script: VecDeque<Vec<u8>>,
    sensor: Option<SensorEmulation>,
    last_outputs: Vec<u8>,
    exchanges: u64,
    calls: Vec<MasterCall>,
}

impl SimBus {
    fn ensure_open(&self) -> AcqResult<()> {
        if self.adapter.is_some() {
            Ok(())
        } else {
            Err(AcqError::Fieldbus("simulated master not open".into()))
        }
    }

    fn node_mut(&mut self, position: u16) -> AcqResult<&mut SimNode> {
        self.nodes
            .get_mut(usize::from(position))
            .ok_or_else(|| AcqError::Fieldbus(format!("no slave at position {position}")))
    }

    /// State a node ends up in when `target` is requested.
    fn reachable(&self, current: AlStatus, target: SlaveState) -> AlStatus {
        if current.state == SlaveState::None {
            return current;
        }
        match target {
            SlaveState::SafeOp if self.block_safe_op => AlStatus::new(SlaveState::PreOp),
            SlaveState::Op if self.block_op => AlStatus::new(SlaveState::SafeOp),
            _ => AlStatus::new(target),
        }
    }

    fn lowest_state(&self) -> SlaveState {
        self.nodes
            .iter()
            .map(|n| n.status.state)
            .min_by_key(|s| *s as u8)
            .unwrap_or(SlaveState::None)
    }
}

/// Simulated fieldbus master.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMaster {
    bus: Arc<Mutex<SimBus>>,
}

impl SimulatedMaster {
    /// Create a master with an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a master with one IRIS node emulating the sensor with the
    /// default acquisition codes.
    pub fn with_iris_node() -> Self {
        Self::with_iris_codes(&AcquisitionConfig::default())
    }

    /// Create a master with one IRIS node emulating the sensor with the
    /// given acquisition codes.
    pub fn with_iris_codes(codes: &AcquisitionConfig) -> Self {
        let spec = SlaveSpec::iris();
        let master = Self::new();
        master.add_slave(
            SlaveInfo::new(0, spec.name, SlaveIdentity::new(spec.vendor_id, spec.product_code))
                .with_io(IRIS_INPUT_SIZE, IRIS_OUTPUT_SIZE),
        );
        lock(&master.bus).sensor = Some(SensorEmulation {
            data_code: codes.data_code,
            full_signal: codes.full_signal,
            start_command: codes.start_command,
            step: 0,
            cycle: 0,
        });
        master
    }

    /// Append a node at the next position.
    pub fn add_slave(&self, info: SlaveInfo) {
        let mut bus = lock(&self.bus);
        let position = bus.nodes.len() as u16;
        bus.nodes.push(SimNode {
            info: SlaveInfo { position, ..info },
            status: AlStatus::new(SlaveState::Init),
            reconfigure_ok: true,
            recover_ok: true,
        });
    }

    /// Force the observed status of a node.
    pub fn set_slave_status(&self, position: u16, status: AlStatus) {
        if let Some(node) = lock(&self.bus).nodes.get_mut(usize::from(position)) {
            node.status = status;
        }
    }

    /// Current status of a node.
    pub fn slave_status(&self, position: u16) -> Option<AlStatus> {
        lock(&self.bus)
            .nodes
            .get(usize::from(position))
            .map(|n| n.status)
    }

    /// Outcome of future reconfiguration attempts for a node.
    pub fn set_reconfigure_result(&self, position: u16, ok: bool) {
        if let Some(node) = lock(&self.bus).nodes.get_mut(usize::from(position)) {
            node.reconfigure_ok = ok;
        }
    }

    /// Outcome of future recovery attempts for a node.
    pub fn set_recover_result(&self, position: u16, ok: bool) {
        if let Some(node) = lock(&self.bus).nodes.get_mut(usize::from(position)) {
            node.recover_ok = ok;
        }
    }

    /// Keep nodes out of SAFE_OP when it is requested.
    pub fn block_safe_op(&self, blocked: bool) {
        lock(&self.bus).block_safe_op = blocked;
    }

    /// Keep nodes out of OP when it is requested.
    pub fn block_op(&self, blocked: bool) {
        lock(&self.bus).block_op = blocked;
    }

    /// Make every exchange fail.
    pub fn fail_exchanges(&self, fail: bool) {
        lock(&self.bus).fail_exchange = fail;
    }

    /// Report a working counter `deficit` below the expected value.
    pub fn set_wkc_deficit(&self, deficit: u16) {
        lock(&self.bus).wkc_deficit = deficit;
    }

    /// Queue a raw input frame for the first node. Queued frames take
    /// precedence over the sensor emulation, one per exchange.
    pub fn push_input(&self, frame: Vec<u8>) {
        lock(&self.bus).script.push_back(frame);
    }

    /// Number of queued input frames not yet delivered.
    pub fn pending_inputs(&self) -> usize {
        lock(&self.bus).script.len()
    }

    /// Disable the sensor emulation so that only queued frames are delivered.
    pub fn disable_sensor(&self) {
        lock(&self.bus).sensor = None;
    }

    /// Outputs seen by the last exchange.
    pub fn last_outputs(&self) -> Vec<u8> {
        lock(&self.bus).last_outputs.clone()
    }

    /// Number of successful exchanges.
    pub fn exchange_count(&self) -> u64 {
        lock(&self.bus).exchanges
    }

    /// Returns true between `open` and `close`.
    pub fn is_open(&self) -> bool {
        lock(&self.bus).adapter.is_some()
    }

    /// Recorded master operations.
    pub fn calls(&self) -> Vec<MasterCall> {
        lock(&self.bus).calls.clone()
    }

    /// Forget recorded master operations.
    pub fn clear_calls(&self) {
        lock(&self.bus).calls.clear();
    }
}

impl FieldbusMaster for SimulatedMaster {
    fn open(&mut self, adapter: &str) -> AcqResult<()> {
        let mut bus = lock(&self.bus);
        bus.calls.push(MasterCall::Open(adapter.to_string()));
        bus.adapter = Some(adapter.to_string());
        debug!(adapter, "Simulated master opened");
        Ok(())
    }

    fn enumerate_slaves(&mut self) -> AcqResult<Vec<SlaveInfo>> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::Enumerate);
        Ok(bus.nodes.iter().map(|n| n.info.clone()).collect())
    }

    fn map_process_image(&mut self) -> AcqResult<ImageLayout> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::Map);
        let infos: Vec<SlaveInfo> = bus.nodes.iter().map(|n| n.info.clone()).collect();
        bus.layout = ImageLayout::packed(&infos);
        for node in &mut bus.nodes {
            if node.status.state == SlaveState::Init {
                node.status = AlStatus::new(SlaveState::PreOp);
            }
        }
        Ok(bus.layout.clone())
    }

    fn exchange(
        &mut self,
        outputs: &[u8],
        inputs: &mut [u8],
        _timeout: Duration,
    ) -> AcqResult<u16> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        if bus.fail_exchange {
            return Err(AcqError::Fieldbus("simulated receive timeout".into()));
        }

        bus.last_outputs.clear();
        bus.last_outputs.extend_from_slice(outputs);

        if let Some(region) = bus.layout.first().copied() {
            let end = (region.input_offset + region.input_size).min(inputs.len());
            let frame = &mut inputs[region.input_offset.min(end)..end];
            let out_end = (region.output_offset + region.output_size).min(outputs.len());
            let node_outputs = &outputs[region.output_offset.min(out_end)..out_end];

            let scripted = bus.script.pop_front();
            if let Some(scripted) = scripted {
                frame.fill(0);
                let n = scripted.len().min(frame.len());
                frame[..n].copy_from_slice(&scripted[..n]);
            } else if let Some(sensor) = bus.sensor.as_mut() {
                sensor.next_frame(node_outputs, frame);
            }
        }

        bus.exchanges += 1;
        let wkc = bus.layout.expected_wkc.saturating_sub(bus.wkc_deficit);
        trace!(wkc, "Simulated exchange");
        Ok(wkc)
    }

    fn request_state(&mut self, state: SlaveState) -> AcqResult<()> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::RequestState(state));
        for i in 0..bus.nodes.len() {
            let next = bus.reachable(bus.nodes[i].status, state);
            bus.nodes[i].status = next;
        }
        debug!(%state, "Simulated state request");
        Ok(())
    }

    fn check_state(&mut self, target: SlaveState, _timeout: Duration) -> AcqResult<SlaveState> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::CheckState(target));
        Ok(bus.lowest_state())
    }

    fn read_states(&mut self) -> AcqResult<Vec<AlStatus>> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::ReadStates);
        Ok(bus.nodes.iter().map(|n| n.status).collect())
    }

    fn write_slave_state(
        &mut self,
        position: u16,
        state: SlaveState,
        acknowledge: bool,
    ) -> AcqResult<()> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::WriteSlaveState {
            position,
            state,
            acknowledge,
        });
        let current = bus.node_mut(position)?.status;
        if current.error && !acknowledge {
            return Ok(());
        }
        let next = bus.reachable(AlStatus::new(current.state), state);
        bus.node_mut(position)?.status = next;
        Ok(())
    }

    fn reconfigure_slave(&mut self, position: u16, _timeout: Duration) -> AcqResult<bool> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::Reconfigure(position));
        let node = bus.node_mut(position)?;
        if node.reconfigure_ok {
            node.status = AlStatus::new(SlaveState::Op);
        }
        Ok(node.reconfigure_ok)
    }

    fn recover_slave(&mut self, position: u16, _timeout: Duration) -> AcqResult<bool> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::Recover(position));
        let node = bus.node_mut(position)?;
        if node.recover_ok {
            node.status = AlStatus::new(SlaveState::Op);
        }
        Ok(node.recover_ok)
    }

    fn check_slave_state(
        &mut self,
        position: u16,
        target: SlaveState,
        _timeout: Duration,
    ) -> AcqResult<AlStatus> {
        let mut bus = lock(&self.bus);
        bus.ensure_open()?;
        bus.calls.push(MasterCall::CheckSlaveState(position, target));
        Ok(bus.node_mut(position)?.status)
    }

    fn close(&mut self) -> AcqResult<()> {
        let mut bus = lock(&self.bus);
        bus.calls.push(MasterCall::Close);
        bus.adapter = None;
        debug!("Simulated master closed");
        Ok(())
    }
}
