//! Measurement search and the per-device score table.

use crate::store::{DeviceRecord, MeasurementRecord};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use iris_common::error::{AcqError, AcqResult};
use serde::{Deserialize, Serialize};

/// Format of the timestamp bounds of a [`MeasurementQuery`].
pub const QUERY_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

fn default_end_score() -> f64 {
    f64::MAX
}

/// Filter over persisted measurements. Every populated field must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementQuery {
    /// Substring of the serial number.
    #[serde(default)]
    pub sn: Option<String>,
    /// Substring of the decimal record id.
    #[serde(default)]
    pub id: Option<String>,
    /// Substring of the job id.
    #[serde(default)]
    pub job_id: Option<String>,
    /// Lower time bound; only applied together with `end_timestamp`.
    #[serde(default)]
    pub start_timestamp: Option<String>,
    /// Upper time bound; only applied together with `start_timestamp`.
    #[serde(default)]
    pub end_timestamp: Option<String>,
    /// Lowest accepted score value.
    #[serde(default)]
    pub start_score: f64,
    /// Highest accepted score value.
    #[serde(default = "default_end_score")]
    pub end_score: f64,
    /// Tags that must all be present.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for MeasurementQuery {
    fn default() -> Self {
        Self {
            sn: None,
            id: None,
            job_id: None,
            start_timestamp: None,
            end_timestamp: None,
            start_score: 0.0,
            end_score: f64::MAX,
            tags: Vec::new(),
        }
    }
}

fn parse_timestamp(value: &str) -> AcqResult<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(value, QUERY_TIMESTAMP)
        .map_err(|e| AcqError::InvalidRequest(format!("invalid timestamp '{value}': {e}")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| AcqError::InvalidRequest(format!("nonexistent local time '{value}'")))
}

/// Query with its bounds parsed.
struct CompiledQuery<'a> {
    query: &'a MeasurementQuery,
    window: Option<(DateTime<Local>, DateTime<Local>)>,
}

impl<'a> CompiledQuery<'a> {
    fn new(query: &'a MeasurementQuery) -> AcqResult<Self> {
        if query.start_score > query.end_score {
            return Err(AcqError::InvalidRequest(format!(
                "start_score {} exceeds end_score {}",
                query.start_score, query.end_score
            )));
        }
        let window = match (&query.start_timestamp, &query.end_timestamp) {
            (Some(start), Some(end)) => Some((parse_timestamp(start)?, parse_timestamp(end)?)),
            _ => None,
        };
        Ok(Self { query, window })
    }

    fn matches(&self, record: &MeasurementRecord) -> bool {
        let q = self.query;
        if q.sn.as_deref().is_some_and(|sn| !record.sn.contains(sn)) {
            return false;
        }
        if q
            .id
            .as_deref()
            .is_some_and(|id| !record.id.to_string().contains(id))
        {
            return false;
        }
        if q.job_id.as_deref().is_some_and(|id| !record.job_id.contains(id)) {
            return false;
        }
        if let Some((start, end)) = self.window {
            if record.timestamp < start || record.timestamp > end {
                return false;
            }
        }

        let range = q.start_score..=q.end_score;
        if !record
            .score_values()
            .iter()
            .all(|&v| range.contains(&f64::from(v)))
        {
            return false;
        }

        if !q.tags.is_empty() {
            let first = record.tags.first().map(String::as_str).unwrap_or_default();
            let present: Vec<&str> = first.split(',').map(str::trim).collect();
            if !q.tags.iter().all(|t| present.contains(&t.as_str())) {
                return false;
            }
        }
        true
    }
}

/// Records of `records` matching `query`, in input order.
///
/// # Errors
///
/// Returns [`AcqError::InvalidRequest`] for an unparsable timestamp bound or
/// an inverted score range.
pub fn search(
    records: &[MeasurementRecord],
    query: &MeasurementQuery,
) -> AcqResult<Vec<MeasurementRecord>> {
    let compiled = CompiledQuery::new(query)?;
    Ok(records
        .iter()
        .filter(|r| compiled.matches(r))
        .cloned()
        .collect())
}

/// Score history laid out with one column per device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreTable {
    /// Serial numbers of the devices with at least one record.
    pub header: Vec<String>,
    /// Row `i` holds the `i`-th record of every device.
    pub rows: Vec<Vec<String>>,
}

fn format_cell(values: &[u32]) -> String {
    if values.is_empty() {
        return "-".to_string();
    }
    let joined: Vec<String> = values.iter().map(u32::to_string).collect();
    format!("[{}]", joined.join(", "))
}

impl ScoreTable {
    /// Build the table for `devices` from `records`, each column in record
    /// order. Devices that never measured get no column.
    pub fn build(devices: &[DeviceRecord], records: &[MeasurementRecord]) -> Self {
        let (header, columns): (Vec<String>, Vec<Vec<String>>) = devices
            .iter()
            .map(|d| {
                let column: Vec<String> = records
                    .iter()
                    .filter(|r| r.sn == d.sn)
                    .map(|r| format_cell(&r.score_values()))
                    .collect();
                (d.sn.clone(), column)
            })
            .filter(|(_, column)| !column.is_empty())
            .unzip();

        let height = columns.iter().map(Vec::len).max().unwrap_or(0);
        let rows = (0..height)
            .map(|i| {
                columns
                    .iter()
                    .map(|c| c.get(i).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();

        Self { header, rows }
    }
}
