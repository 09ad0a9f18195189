//! Measurement job acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A job of N cycles persists exactly N records, then the device is idle
//! - Every record has its sample file of tab-separated byte triples
//! - A second start for a running device is rejected
//! - Stopping a stopped device succeeds with an "already stopped" message
//! - Score polling reports completion once the device is idle

use super::common::{wait_for, ServiceRig};
use iris_acquisition::{ControlRequest, JobRequest, MeasurementStore, SyntheticScores};
use iris_common::state::AcquisitionState;
use serde_json::json;
use std::sync::Arc;

fn request(value: serde_json::Value) -> ControlRequest {
    serde_json::from_value(value).expect("valid control request")
}

#[test]
fn test_job_lifecycle_through_control_requests() {
    let rig = ServiceRig::open();

    let response = rig.controller.handle(request(json!({
        "op": "measure-start",
        "sn": "1001",
        "refs": [{"id": 11206, "eq": ["EQ1", "EQ2"]}, {"id": 11207, "eq": ["EQ3"]}],
        "auto": true,
        "interval": 0,
        "repeat": 3,
        "tags": ["field,batch-7"]
    })));
    assert!(response.success, "{}", response.message);
    let data = response.data.unwrap();
    let measure_id = data["measureId"].as_str().unwrap().to_string();
    assert!(measure_id.starts_with("1001_"));

    assert!(rig.wait_idle("1001"));

    let response = rig.controller.handle(request(json!({
        "op": "measure-score",
        "sn": "1001",
        "measureId": measure_id
    })));
    assert!(response.success);
    assert_eq!(response.message, "1001 completed");
    let records = response.data.unwrap();
    assert_eq!(records.as_array().unwrap().len(), 3);
    assert_eq!(records[0]["score"][0]["values"][1]["value"], 70);
    assert_eq!(records[0]["score"][1]["id"], 11207);

    let device = rig.store.device("1001").unwrap();
    assert_eq!(device.count, 3);
    assert!(!device.running);

    let files = rig.sample_files();
    assert!(!files.is_empty());
    for file in &files {
        let text = std::fs::read_to_string(file).unwrap();
        assert!(!text.is_empty());
        for line in text.lines() {
            let fields: Vec<u8> = line.split('\t').map(|f| f.parse().unwrap()).collect();
            assert_eq!(fields.len(), 3);
        }
    }

    let response = rig.controller.handle(request(json!({"op": "measure-stop", "sn": "1001"})));
    assert!(response.success);
    assert_eq!(response.message, "1001 already stopped");

    assert_eq!(rig.acquisition.state(), AcquisitionState::Stopped);
    rig.close().unwrap();
}

#[test]
fn test_duplicate_start_rejected_until_stopped() {
    let rig = ServiceRig::open();
    let long = JobRequest::new("1001", 10).with_interval(std::time::Duration::from_secs(30));

    let response = rig
        .controller
        .handle(ControlRequest::MeasureStart(long.clone()));
    assert!(response.success);

    let response = rig
        .controller
        .handle(ControlRequest::MeasureStart(long.clone()));
    assert!(!response.success);
    assert_eq!(response.message, "1001 is already running");
    assert!(response.data.is_none());

    let response = rig
        .controller
        .handle(ControlRequest::MeasureStop { sn: "1001".into() });
    assert_eq!(response.message, "1001 stopped");
    assert!(!rig.controller.is_job_running("1001").unwrap());

    // At most the first cycle was recorded before the pause
    assert!(rig.store.measurements().unwrap().len() <= 1);

    let response = rig.controller.handle(ControlRequest::MeasureStart(long));
    assert!(response.success);
    rig.close().unwrap();
}

#[test]
fn test_queries_after_two_devices() {
    let rig = ServiceRig::builder()
        .scores(Arc::new(SyntheticScores::new(10..=20)))
        .open()
        .unwrap();

    for sn in ["1001", "1002"] {
        let response = rig.controller.handle(ControlRequest::MeasureStart(
            JobRequest::new(sn, 2)
                .with_refs(vec![iris_acquisition::ReferenceChannel {
                    id: 1,
                    eq: vec!["EQ1".into()],
                }])
                .with_tags(vec![format!("device-{sn}")]),
        ));
        assert!(response.success, "{}", response.message);
        assert!(rig.wait_idle(sn));
    }

    let response = rig.controller.handle(ControlRequest::DeviceMeasure);
    let devices = response.data.unwrap();
    assert_eq!(devices.as_array().unwrap().len(), 2);
    assert_eq!(devices[1]["count"], 2);

    let response = rig.controller.handle(ControlRequest::Operation);
    let table = response.data.unwrap();
    assert_eq!(table["header"], json!(["1001", "1002"]));
    assert_eq!(table["rows"].as_array().unwrap().len(), 2);

    let response = rig.controller.handle(request(json!({
        "op": "search",
        "tags": ["device-1002"],
        "start_score": 10,
        "end_score": 20
    })));
    let found = response.data.unwrap();
    assert_eq!(found.as_array().unwrap().len(), 2);
    assert!(found
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["sn"] == "1002"));

    let response = rig.controller.handle(request(json!({
        "op": "search",
        "start_timestamp": "not a time",
        "end_timestamp": "2024-01-01 00:00:00"
    })));
    assert!(!response.success);

    assert!(wait_for(|| rig.sim.last_outputs().iter().all(|b| *b == 0)));
    rig.close().unwrap();
}
