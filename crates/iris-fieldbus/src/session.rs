//! Fieldbus session lifecycle.
//!
//! [`SessionBuilder::open`] brings the network up (enumerate, verify the
//! topology, map the process image, SAFE_OP, background loops, OP) and
//! [`FieldbusSession::close`] takes it down again. The session is an
//! explicitly owned value; dropping it without `close` still stops the loops
//! and releases the adapter.

use crate::exchange::{ExchangeLoop, FrameCodes, FrameSink};
use crate::health::HealthMonitor;
use crate::image::{ExchangeStats, ProcessImage};
use crate::link::BusLink;
use crate::master::{FieldbusMaster, ImageLayout, SharedMaster};
use crate::slave::{LiveSlave, SlaveDescriptor, SlaveInfo, SlaveState};
use iris_common::config::FieldbusConfig;
use iris_common::error::{AcqError, AcqResult};
use iris_common::sync::lock;
use iris_common::task::PeriodicTask;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Adapter name used when none is configured.
pub const DEFAULT_ADAPTER: &str = "sim0";

/// Builder collecting the collaborators of a session.
pub struct SessionBuilder {
    config: FieldbusConfig,
    descriptors: Vec<SlaveDescriptor>,
    codes: FrameCodes,
    link: Option<Arc<BusLink>>,
    sink: Option<Arc<dyn FrameSink>>,
}

impl SessionBuilder {
    /// Start from a configuration; the expected topology comes from
    /// `config.slaves`.
    pub fn new(config: &FieldbusConfig) -> Self {
        Self {
            descriptors: config.slaves.iter().map(SlaveDescriptor::from).collect(),
            config: config.clone(),
            codes: FrameCodes::default(),
            link: None,
            sink: None,
        }
    }

    /// Replace the expected topology.
    #[must_use]
    pub fn descriptors(mut self, descriptors: Vec<SlaveDescriptor>) -> Self {
        self.descriptors = descriptors;
        self
    }

    /// Set the acquisition codes used to classify frames.
    #[must_use]
    pub fn codes(mut self, codes: FrameCodes) -> Self {
        self.codes = codes;
        self
    }

    /// Share an existing link (typically the one an acquisition writes to).
    #[must_use]
    pub fn link(mut self, link: Arc<BusLink>) -> Self {
        self.link = Some(link);
        self
    }

    /// Set the consumer of decoded frames.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Open the session on `master`.
    ///
    /// # Errors
    ///
    /// - [`AcqError::NoSlaveFound`] if no node answers
    /// - [`AcqError::UnexpectedLayout`] if a node does not match the topology
    /// - [`AcqError::SafeOpTimeout`] if SAFE_OP is not reached in time
    ///
    /// The adapter is released before any of these is returned.
    pub fn open(self, master: impl FieldbusMaster + 'static) -> AcqResult<FieldbusSession> {
        let config = self.config;
        let adapter = config
            .adapter
            .clone()
            .unwrap_or_else(|| DEFAULT_ADAPTER.to_string());
        let link = self.link.unwrap_or_default();

        let mut master: Box<dyn FieldbusMaster> = Box::new(master);
        master.open(&adapter)?;
        info!(adapter = %adapter, "Fieldbus adapter opened");

        let (infos, layout) = match bring_up(&mut *master, &adapter, &self.descriptors, &config)
        {
            Ok(mapped) => mapped,
            Err(e) => {
                error!(adapter = %adapter, error = %e, "Fieldbus startup failed");
                if let Err(close_err) = master.close() {
                    warn!(error = %close_err, "Failed to close adapter after startup failure");
                }
                return Err(e);
            }
        };

        let first = layout.first().copied().unwrap_or_default();
        link.reset_outputs(first.output_size);
        link.set_expected_wkc(layout.expected_wkc);
        link.set_in_op(false);

        let master: SharedMaster = Arc::new(Mutex::new(master));
        let slaves: Vec<LiveSlave> = infos.iter().map(LiveSlave::new).collect();

        let mut session = FieldbusSession {
            adapter,
            master: Arc::clone(&master),
            link: Arc::clone(&link),
            layout: layout.clone(),
            slaves: Vec::new(),
            exchange: None,
            health: None,
            all_op_reached: false,
            closed: false,
        };

        // Dropping `session` on a spawn failure releases the adapter.
        let monitor = HealthMonitor::new(
            Arc::clone(&master),
            Arc::clone(&link),
            slaves,
            config.op_check_timeout,
        );
        link.set_health_running(true);
        session.health = Some(
            PeriodicTask::spawn("iris-health", config.health_period, monitor)
                .map_err(|e| {
                    link.set_health_running(false);
                    e
                })?,
        );

        let exchange = ExchangeLoop::new(
            Arc::clone(&master),
            Arc::clone(&link),
            ProcessImage::new(&layout),
            first.position,
            config.receive_timeout,
        )
        .with_sink(self.sink, self.codes);
        link.set_exchange_running(true);
        session.exchange = Some(
            PeriodicTask::spawn("iris-exchange", config.exchange_period, exchange)
                .map_err(|e| {
                    link.set_exchange_running(false);
                    e
                })?,
        );

        session.prime(&config);
        session.all_op_reached = session.request_operational(&config);
        link.set_in_op(true);

        info!(
            adapter = %session.adapter,
            slaves = infos.len(),
            all_op = session.all_op_reached,
            "Fieldbus session open"
        );
        Ok(session)
    }
}

/// Steps of `open` up to SAFE_OP, before anything runs in the background.
fn bring_up(
    master: &mut dyn FieldbusMaster,
    adapter: &str,
    descriptors: &[SlaveDescriptor],
    config: &FieldbusConfig,
) -> AcqResult<(Vec<SlaveInfo>, ImageLayout)> {
    let infos = master.enumerate_slaves()?;
    if infos.is_empty() {
        return Err(AcqError::NoSlaveFound {
            adapter: adapter.to_string(),
        });
    }

    for info in &infos {
        let descriptor = descriptors.get(usize::from(info.position));
        match descriptor {
            Some(descriptor) if descriptor.matches(info) => {
                debug!(position = info.position, slave = %descriptor, "Slave identity verified");
                if let Some(hook) = &descriptor.config_hook {
                    hook(info)?;
                }
            }
            _ => {
                return Err(AcqError::UnexpectedLayout {
                    position: info.position,
                    expected: descriptor.map_or_else(|| "no slave".to_string(), ToString::to_string),
                    vendor_id: info.identity.vendor_id,
                    product_code: info.identity.product_code,
                });
            }
        }
    }

    let layout = master.map_process_image()?;
    debug!(
        inputs = layout.input_size,
        outputs = layout.output_size,
        expected_wkc = layout.expected_wkc,
        "Process image mapped"
    );

    master.request_state(SlaveState::SafeOp)?;
    let reached = master.check_state(SlaveState::SafeOp, config.safe_op_timeout)?;
    if reached != SlaveState::SafeOp {
        return Err(AcqError::SafeOpTimeout {
            timeout_ms: u64::try_from(config.safe_op_timeout.as_millis()).unwrap_or(u64::MAX),
            reached: reached.to_string(),
        });
    }

    Ok((infos, layout))
}

/// An open fieldbus session.
pub struct FieldbusSession {
    adapter: String,
    master: SharedMaster,
    link: Arc<BusLink>,
    layout: ImageLayout,
    slaves: Vec<LiveSlave>,
    exchange: Option<PeriodicTask<ExchangeLoop>>,
    health: Option<PeriodicTask<HealthMonitor>>,
    all_op_reached: bool,
    closed: bool,
}

impl FieldbusSession {
    /// Builder for a session.
    pub fn builder(config: &FieldbusConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// One blocking exchange so the nodes see valid outputs before OP.
    fn prime(&self, config: &FieldbusConfig) {
        let mut image = ProcessImage::new(&self.layout);
        let position = self.layout.first().map_or(0, |r| r.position);
        self.link.copy_outputs_into(image.slave_outputs_mut(position));

        let (outputs, inputs) = image.exchange_buffers();
        if let Err(e) = lock(&self.master).exchange(outputs, inputs, config.prime_timeout) {
            warn!(error = %e, "Priming exchange failed");
        }
    }

    /// Request OP and poll for confirmation. The master lock is released
    /// between polls so the exchange loop keeps running.
    fn request_operational(&self, config: &FieldbusConfig) -> bool {
        if let Err(e) = lock(&self.master).request_state(SlaveState::Op) {
            warn!(error = %e, "Failed to request OP state");
        }

        for attempt in 1..=config.op_check_attempts {
            match lock(&self.master).check_state(SlaveState::Op, config.op_check_timeout) {
                Ok(SlaveState::Op) => {
                    debug!(attempt, "All slaves reached OP");
                    return true;
                }
                Ok(state) => debug!(attempt, lowest = %state, "Waiting for OP"),
                Err(e) => warn!(attempt, error = %e, "OP state check failed"),
            }
        }

        warn!(attempts = config.op_check_attempts, "Not all slaves reached OP state");
        false
    }

    /// Adapter name.
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    /// Shared link to the background loops.
    pub fn link(&self) -> &Arc<BusLink> {
        &self.link
    }

    /// Mapped process image layout.
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Exchange statistics.
    pub fn stats(&self) -> ExchangeStats {
        self.link.stats()
    }

    /// Returns true if OP was confirmed during `open`.
    pub fn all_op_reached(&self) -> bool {
        self.all_op_reached
    }

    /// Returns true while the network is in operation and both loops run.
    pub fn is_operational(&self) -> bool {
        !self.closed && self.link.in_op() && self.link.loops_running()
    }

    /// Inputs of the first node from the last exchange.
    pub fn inputs(&self) -> Vec<u8> {
        self.link.inputs()
    }

    /// Current output pattern of the first node.
    pub fn outputs(&self) -> Vec<u8> {
        self.link.outputs()
    }

    /// Replace the output pattern of the first node; sent on the next cycle.
    pub fn write_outputs(&self, pattern: &[u8]) {
        self.link.write_outputs(pattern);
    }

    /// Stop the background loops, request INIT and release the adapter.
    ///
    /// Returns the runtime view of the nodes as last seen by the health
    /// monitor.
    ///
    /// # Errors
    ///
    /// Returns [`AcqError::NotAllOperational`] if OP was never confirmed
    /// during `open`; cleanup has completed by then.
    pub fn close(mut self) -> AcqResult<Vec<LiveSlave>> {
        self.shutdown()?;
        Ok(std::mem::take(&mut self.slaves))
    }

    fn shutdown(&mut self) -> AcqResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.link.set_in_op(false);

        if let Some(task) = self.exchange.take() {
            task.stop();
        }
        if let Some(task) = self.health.take() {
            if let Some(monitor) = task.stop() {
                self.slaves = monitor.into_slaves();
            }
        }

        {
            let mut master = lock(&self.master);
            if let Err(e) = master.request_state(SlaveState::Init) {
                warn!(error = %e, "Failed to request INIT state");
            }
            if let Err(e) = master.close() {
                warn!(error = %e, "Failed to close adapter");
            }
        }
        info!(adapter = %self.adapter, "Fieldbus session closed");

        if self.all_op_reached {
            Ok(())
        } else {
            Err(AcqError::NotAllOperational)
        }
    }
}

impl Drop for FieldbusSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Fieldbus session dropped without close");
        }
    }
}
