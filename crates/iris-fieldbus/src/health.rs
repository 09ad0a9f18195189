//! Slave health check and recovery.
//!
//! While the network is operational, a working counter deficit or a pending
//! re-check makes the monitor re-read every node's state and run one step of
//! the recovery chain for each node that is not fully operational.

use crate::link::BusLink;
use crate::master::{FieldbusMaster, SharedMaster};
use crate::slave::{LiveSlave, SlaveState};
use iris_common::error::AcqResult;
use iris_common::sync::lock;
use iris_common::task::Periodic;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One step of the recovery chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    /// SAFE_OP with error indication: acknowledge and request SAFE_OP.
    AcknowledgeError,
    /// SAFE_OP: request OP.
    RequestOp,
    /// Node answers but is not operational: lightweight reconfiguration.
    Reconfigure,
    /// Node silent and not yet lost: re-check its state.
    StateCheck,
    /// Lost node still silent: full recovery.
    Recover,
    /// Lost node answers again.
    Found,
}

/// Select the recovery step for a node. The chain is a strict priority
/// order; exactly one step applies.
pub fn next_action(slave: &LiveSlave) -> RecoveryAction {
    let state = slave.status.state;
    match (state, slave.status.error, slave.lost) {
        (SlaveState::SafeOp, true, _) => RecoveryAction::AcknowledgeError,
        (SlaveState::SafeOp, false, _) => RecoveryAction::RequestOp,
        (_, _, false) if !state.is_none() => RecoveryAction::Reconfigure,
        (_, _, false) => RecoveryAction::StateCheck,
        (SlaveState::None, _, true) => RecoveryAction::Recover,
        (_, _, true) => RecoveryAction::Found,
    }
}

/// Outcome of one recovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Node position.
    pub position: u16,
    /// Step that ran.
    pub action: RecoveryAction,
    /// Whether the step achieved its goal.
    pub succeeded: bool,
}

/// Background work of the slave health check.
pub struct HealthMonitor {
    master: SharedMaster,
    link: Arc<BusLink>,
    slaves: Vec<LiveSlave>,
    timeout: Duration,
    recovering: bool,
}

impl HealthMonitor {
    /// Create a monitor owning the runtime view of the nodes.
    pub fn new(
        master: SharedMaster,
        link: Arc<BusLink>,
        slaves: Vec<LiveSlave>,
        timeout: Duration,
    ) -> Self {
        Self {
            master,
            link,
            slaves,
            timeout,
            recovering: false,
        }
    }

    /// Runtime view of the nodes.
    pub fn slaves(&self) -> &[LiveSlave] {
        &self.slaves
    }

    /// Give the runtime view back to the session.
    pub fn into_slaves(self) -> Vec<LiveSlave> {
        self.slaves
    }

    /// Run one health check and return the recovery steps that ran.
    pub fn check(&mut self) -> Vec<RecoveryOutcome> {
        if !self.link.in_op() || !(self.link.wkc_deficit() || self.link.check_requested()) {
            return Vec::new();
        }
        self.link.take_check_request();

        let mut master = lock(&self.master);
        let states = match master.read_states() {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "Failed to read slave states");
                self.link.request_check();
                return Vec::new();
            }
        };

        let wkc = self.link.actual_wkc();
        let mut outcomes = Vec::new();
        for (slave, status) in self.slaves.iter_mut().zip(states) {
            slave.status = status;
            slave.last_wkc = wkc;
            if !status.is_operational() {
                outcomes.push(recover(&mut **master, slave, self.timeout));
            }
        }

        if outcomes.is_empty() {
            if self.recovering {
                info!("All slaves resumed OPERATIONAL");
            } else {
                debug!(wkc, "Slave states confirmed OPERATIONAL");
            }
            self.recovering = false;
        } else {
            self.link.request_check();
            self.recovering = true;
        }
        outcomes
    }
}

/// Run the recovery step selected for `slave`. Master errors are logged and
/// reported as a failed step.
fn recover(master: &mut dyn FieldbusMaster, slave: &mut LiveSlave, timeout: Duration) -> RecoveryOutcome {
    let action = next_action(slave);
    let position = slave.position;

    let result: AcqResult<bool> = match action {
        RecoveryAction::AcknowledgeError => {
            error!(position, "Slave is in SAFE_OP + ERROR, attempting ack");
            master
                .write_slave_state(position, SlaveState::SafeOp, true)
                .map(|()| true)
        }
        RecoveryAction::RequestOp => {
            warn!(position, "Slave is in SAFE_OP, requesting OPERATIONAL");
            master
                .write_slave_state(position, SlaveState::Op, false)
                .map(|()| true)
        }
        RecoveryAction::Reconfigure => {
            info!(position, state = %slave.status, "Attempting slave reconfiguration");
            master.reconfigure_slave(position, timeout).map(|ok| {
                if ok {
                    slave.lost = false;
                    info!(position, "Slave reconfigured");
                }
                ok
            })
        }
        RecoveryAction::StateCheck => master
            .check_slave_state(position, SlaveState::Op, timeout)
            .map(|status| {
                slave.status = status;
                if status.state.is_none() {
                    slave.lost = true;
                    error!(position, "Slave lost");
                }
                !slave.lost
            }),
        RecoveryAction::Recover => master.recover_slave(position, timeout).map(|ok| {
            if ok {
                slave.lost = false;
                info!(position, "Slave recovered");
            }
            ok
        }),
        RecoveryAction::Found => {
            slave.lost = false;
            info!(position, "Slave found");
            Ok(true)
        }
    };

    let succeeded = result.unwrap_or_else(|e| {
        warn!(position, ?action, error = %e, "Recovery step failed");
        false
    });
    RecoveryOutcome {
        position,
        action,
        succeeded,
    }
}

impl Periodic for HealthMonitor {
    fn tick(&mut self) -> ControlFlow<()> {
        self.check();
        ControlFlow::Continue(())
    }

    fn finish(&mut self) {
        self.link.set_health_running(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::shared;
    use crate::simulated::{MasterCall, SimulatedMaster};
    use crate::slave::AlStatus;

    fn live(state: SlaveState, error: bool, lost: bool) -> LiveSlave {
        LiveSlave {
            position: 0,
            name: "128+128".into(),
            status: AlStatus { state, error },
            lost,
            last_wkc: 0,
        }
    }

    #[test]
    fn test_chain_priority() {
        use RecoveryAction::*;
        use SlaveState::{Init, None as Silent, Op, PreOp, SafeOp};

        assert_eq!(next_action(&live(SafeOp, true, false)), AcknowledgeError);
        assert_eq!(next_action(&live(SafeOp, true, true)), AcknowledgeError);
        assert_eq!(next_action(&live(SafeOp, false, false)), RequestOp);
        assert_eq!(next_action(&live(PreOp, false, false)), Reconfigure);
        assert_eq!(next_action(&live(Init, false, false)), Reconfigure);
        assert_eq!(next_action(&live(Op, true, false)), Reconfigure);
        assert_eq!(next_action(&live(Silent, false, false)), StateCheck);
        assert_eq!(next_action(&live(Silent, false, true)), Recover);
        assert_eq!(next_action(&live(PreOp, false, true)), Found);
    }

    fn monitor(sim: &SimulatedMaster) -> (HealthMonitor, Arc<BusLink>) {
        let mut master = sim.clone();
        master.open("sim0").unwrap();
        let infos = master.enumerate_slaves().unwrap();
        let layout = master.map_process_image().unwrap();
        master.request_state(SlaveState::Op).unwrap();
        sim.clear_calls();

        let link = Arc::new(BusLink::new());
        link.set_expected_wkc(layout.expected_wkc);
        link.set_actual_wkc(layout.expected_wkc);
        link.set_in_op(true);

        let slaves = infos.iter().map(LiveSlave::new).collect();
        let monitor = HealthMonitor::new(shared(master), Arc::clone(&link), slaves, Duration::ZERO);
        (monitor, link)
    }

    #[test]
    fn test_idle_when_healthy() {
        let sim = SimulatedMaster::with_iris_node();
        let (mut monitor, _link) = monitor(&sim);

        assert!(monitor.check().is_empty());
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn test_not_in_op_skips_check() {
        let sim = SimulatedMaster::with_iris_node();
        let (mut monitor, link) = monitor(&sim);
        link.set_in_op(false);
        link.request_check();

        assert!(monitor.check().is_empty());
        assert!(link.check_requested());
    }

    #[test]
    fn test_ack_then_upgrade() {
        let sim = SimulatedMaster::with_iris_node();
        let (mut monitor, link) = monitor(&sim);
        sim.set_slave_status(0, AlStatus::with_error(SlaveState::SafeOp));
        link.request_check();

        let first = monitor.check();
        assert_eq!(first[0].action, RecoveryAction::AcknowledgeError);
        assert!(link.check_requested());

        let second = monitor.check();
        assert_eq!(second[0].action, RecoveryAction::RequestOp);

        assert!(monitor.check().is_empty());
        assert!(!link.check_requested());
        assert_eq!(
            sim.calls(),
            vec![
                MasterCall::ReadStates,
                MasterCall::WriteSlaveState {
                    position: 0,
                    state: SlaveState::SafeOp,
                    acknowledge: true
                },
                MasterCall::ReadStates,
                MasterCall::WriteSlaveState {
                    position: 0,
                    state: SlaveState::Op,
                    acknowledge: false
                },
                MasterCall::ReadStates,
            ]
        );
    }

    #[test]
    fn test_lost_then_recovered() {
        let sim = SimulatedMaster::with_iris_node();
        let (mut monitor, link) = monitor(&sim);
        sim.set_slave_status(0, AlStatus::new(SlaveState::None));
        sim.set_recover_result(0, false);
        link.request_check();

        let outcome = monitor.check();
        assert_eq!(outcome[0].action, RecoveryAction::StateCheck);
        assert!(monitor.slaves()[0].lost);

        let outcome = monitor.check();
        assert_eq!(outcome[0].action, RecoveryAction::Recover);
        assert!(!outcome[0].succeeded);
        assert!(monitor.slaves()[0].lost);

        sim.set_recover_result(0, true);
        let outcome = monitor.check();
        assert!(outcome[0].succeeded);
        assert!(!monitor.slaves()[0].lost);
        assert!(monitor.check().is_empty());
    }

    #[test]
    fn test_lost_slave_found_again() {
        let sim = SimulatedMaster::with_iris_node();
        let (mut monitor, link) = monitor(&sim);
        sim.set_slave_status(0, AlStatus::new(SlaveState::None));
        link.request_check();
        monitor.check();
        assert!(monitor.slaves()[0].lost);

        sim.set_slave_status(0, AlStatus::new(SlaveState::PreOp));
        let outcome = monitor.check();
        assert_eq!(outcome[0].action, RecoveryAction::Found);
        assert!(!monitor.slaves()[0].lost);
    }

    #[test]
    fn test_wkc_deficit_triggers_check() {
        let sim = SimulatedMaster::with_iris_node();
        let (mut monitor, link) = monitor(&sim);
        sim.set_slave_status(0, AlStatus::new(SlaveState::PreOp));
        sim.set_reconfigure_result(0, false);
        link.set_actual_wkc(0);

        for _ in 0..3 {
            let outcome = monitor.check();
            assert_eq!(outcome.len(), 1);
            assert_eq!(outcome[0].action, RecoveryAction::Reconfigure);
            assert!(!monitor.slaves()[0].lost);
        }
        assert_eq!(monitor.slaves()[0].last_wkc, 0);
    }
}
