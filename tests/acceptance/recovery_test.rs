//! Fault handling acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A node falling to SAFE_OP with an error is acknowledged and brought
//!   back to OP while a job keeps running
//! - A work-counter deficit triggers a reconfigure on every check and never
//!   marks the node lost
//! - Exchange failures are counted, never fatal
//! - Startup failures release the adapter; a session that never reached OP
//!   reports it on close

use super::common::{wait_for, ServiceRig};
use iris_acquisition::{JobOutcome, JobRequest, MeasurementStore};
use iris_common::error::AcqError;
use iris_fieldbus::{AlStatus, MasterCall, SimulatedMaster, SlaveIdentity, SlaveInfo, SlaveState};
use std::time::Duration;

fn count_calls(sim: &SimulatedMaster, call: &MasterCall) -> usize {
    sim.calls().iter().filter(|c| *c == call).count()
}

#[test]
fn test_job_survives_safe_op_error() {
    let rig = ServiceRig::open();
    rig.controller
        .start_job(JobRequest::new("1001", 4).with_interval(Duration::from_millis(5)))
        .unwrap();
    assert!(wait_for(|| !rig.store.measurements().unwrap().is_empty()));

    rig.sim.clear_calls();
    rig.sim
        .set_slave_status(0, AlStatus::with_error(SlaveState::SafeOp));
    rig.session().link().request_check();

    assert!(wait_for(|| rig.sim.slave_status(0) == Some(AlStatus::new(SlaveState::Op))));
    assert!(
        count_calls(
            &rig.sim,
            &MasterCall::WriteSlaveState {
                position: 0,
                state: SlaveState::SafeOp,
                acknowledge: true,
            }
        ) >= 1
    );

    assert!(rig.wait_idle("1001"));
    let report = rig.controller.wait_job("1001").unwrap();
    assert_eq!(report.outcome, JobOutcome::Completed);
    assert_eq!(rig.store.measurements().unwrap().len(), 4);
    rig.close().unwrap();
}

#[test]
fn test_wkc_deficit_reconfigures_and_job_completes() {
    let rig = ServiceRig::open();
    rig.sim.clear_calls();
    rig.sim.set_reconfigure_result(0, false);
    rig.sim.set_slave_status(0, AlStatus::new(SlaveState::PreOp));
    rig.sim.set_wkc_deficit(1);

    rig.controller.start_job(JobRequest::new("1001", 3)).unwrap();
    assert!(wait_for(|| count_calls(&rig.sim, &MasterCall::Reconfigure(0)) >= 3));
    assert_eq!(count_calls(&rig.sim, &MasterCall::Recover(0)), 0);
    assert!(rig.session().stats().wkc_errors > 0);

    rig.sim.set_reconfigure_result(0, true);
    rig.sim.set_wkc_deficit(0);
    assert!(wait_for(|| rig.sim.slave_status(0) == Some(AlStatus::new(SlaveState::Op))));

    assert!(rig.wait_idle("1001"));
    assert_eq!(
        rig.controller.wait_job("1001").unwrap().outcome,
        JobOutcome::Completed
    );

    let ServiceRig {
        controller,
        session,
        ..
    } = rig;
    drop(controller);
    let slaves = session.unwrap().close().unwrap();
    assert!(!slaves[0].lost);
}

#[test]
fn test_exchange_outage_is_not_fatal() {
    let rig = ServiceRig::open();
    rig.sim.fail_exchanges(true);

    rig.controller.start_job(JobRequest::new("1001", 2)).unwrap();
    assert!(wait_for(|| rig.session().stats().failures >= 5));
    assert!(rig.session().is_operational());
    assert!(rig.store.measurements().unwrap().is_empty());

    rig.sim.fail_exchanges(false);
    assert!(rig.wait_idle("1001"));
    assert_eq!(rig.store.measurements().unwrap().len(), 2);
    rig.close().unwrap();
}

#[test]
fn test_exchange_outage_drives_lost_node_recovery() {
    let rig = ServiceRig::open();
    rig.sim.set_recover_result(0, false);
    rig.sim.clear_calls();
    rig.sim.fail_exchanges(true);
    rig.sim.set_slave_status(0, AlStatus::new(SlaveState::None));

    assert!(wait_for(|| rig.session().link().wkc_deficit()));
    assert!(wait_for(|| count_calls(&rig.sim, &MasterCall::Recover(0)) >= 2));
    assert!(count_calls(&rig.sim, &MasterCall::ReadStates) >= 2);
    assert!(count_calls(&rig.sim, &MasterCall::CheckSlaveState(0, SlaveState::Op)) >= 1);

    rig.sim.set_recover_result(0, true);
    assert!(wait_for(|| rig.sim.slave_status(0) == Some(AlStatus::new(SlaveState::Op))));
    rig.sim.fail_exchanges(false);
    assert!(wait_for(|| !rig.session().link().wkc_deficit()));
    assert!(rig.session().is_operational());
    rig.close().unwrap();
}

#[test]
fn test_startup_failure_releases_adapter() {
    let sim = SimulatedMaster::new();
    sim.add_slave(
        SlaveInfo::new(0, "EL1259", SlaveIdentity::new(0x2, 0x04eb_3052)).with_io(8, 8),
    );

    let Err(err) = ServiceRig::builder().master(sim.clone()).open() else {
        panic!("open should fail on a foreign node");
    };
    assert!(matches!(err, AcqError::UnexpectedLayout { position: 0, .. }));
    assert!(err.is_fatal());
    assert!(!sim.is_open());

    let Err(err) = ServiceRig::builder().master(SimulatedMaster::new()).open() else {
        panic!("open should fail without nodes");
    };
    assert!(matches!(err, AcqError::NoSlaveFound { .. }));
}

#[test]
fn test_op_never_reached_reported_on_close() {
    let sim = SimulatedMaster::with_iris_node();
    sim.block_op(true);

    let rig = ServiceRig::builder().master(sim.clone()).open().unwrap();
    assert!(!rig.session().all_op_reached());

    assert_eq!(rig.close().unwrap_err(), AcqError::NotAllOperational);
    assert!(!sim.is_open());
}
