//! Job result payloads and their normalization into flat records.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExpDataError, ExpDataResult};

/// One flat key/value unit of raw output data.
pub type Record = serde_json::Map<String, Value>;

/// Measurement counts keyed by bitstring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts(FxHashMap<String, u64>);

impl Counts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a counts mapping whose keys are hexadecimal (`"0x3"`) or
    /// already bitstrings. Hex keys are zero-padded to `memory_slots`.
    pub fn from_hex(raw: &Record, memory_slots: Option<u32>) -> ExpDataResult<Self> {
        let mut counts = FxHashMap::default();
        for (key, value) in raw {
            let count = value.as_u64().ok_or_else(|| {
                ExpDataError::UnsupportedData(format!("count for '{key}' is not an integer"))
            })?;
            let bitstring = match key.strip_prefix("0x") {
                Some(hex) => {
                    let n = u128::from_str_radix(hex, 16).map_err(|_| {
                        ExpDataError::UnsupportedData(format!("invalid hex outcome '{key}'"))
                    })?;
                    let width = memory_slots.unwrap_or(0) as usize;
                    format!("{n:0width$b}")
                }
                None => key.clone(),
            };
            *counts.entry(bitstring).or_insert(0) += count;
        }
        Ok(Self(counts))
    }

    pub fn insert(&mut self, bitstring: impl Into<String>, count: u64) {
        self.0.insert(bitstring.into(), count);
    }

    pub fn get(&self, bitstring: &str) -> u64 {
        self.0.get(bitstring).copied().unwrap_or(0)
    }

    pub fn total_shots(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_record(&self) -> Record {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for Counts {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Header attached to a single circuit result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_slots: Option<u32>,
}

/// Result for one circuit of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub shots: u64,
    pub meas_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meas_return: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<ResultHeader>,
    /// Raw data, e.g. `counts` (hex keys) or `memory`.
    #[serde(default)]
    pub data: Record,
}

impl ExperimentResult {
    pub fn new(shots: u64, meas_level: u8) -> Self {
        Self {
            shots,
            meas_level,
            meas_return: None,
            header: None,
            data: Record::new(),
        }
    }

    pub fn with_meas_return(mut self, meas_return: impl Into<String>) -> Self {
        self.meas_return = Some(meas_return.into());
        self
    }

    pub fn with_header(mut self, header: ResultHeader) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_metadata(mut self, metadata: Record) -> Self {
        self.header.get_or_insert_with(ResultHeader::default).metadata = Some(metadata);
        self
    }

    /// Raw hex-keyed counts, as returned by a device.
    pub fn with_hex_counts(mut self, counts: Record) -> Self {
        self.data.insert("counts".to_string(), Value::Object(counts));
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    fn to_record(&self, job_id: &str) -> ExpDataResult<Record> {
        let mut record = self.data.clone();
        record.insert("job_id".to_string(), Value::from(job_id));

        if let Some(Value::Object(raw)) = self.data.get("counts") {
            let slots = self.header.as_ref().and_then(|h| h.memory_slots);
            let counts = Counts::from_hex(raw, slots)?;
            record.insert("counts".to_string(), Value::Object(counts.to_record()));
        }
        if let Some(metadata) = self.header.as_ref().and_then(|h| h.metadata.clone()) {
            record.insert("metadata".to_string(), Value::Object(metadata));
        }
        record.insert("shots".to_string(), Value::from(self.shots));
        record.insert("meas_level".to_string(), Value::from(self.meas_level));
        if let Some(meas_return) = &self.meas_return {
            record.insert("meas_return".to_string(), Value::from(meas_return.as_str()));
        }
        Ok(record)
    }
}

/// Complete result bundle of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_name: Option<String>,
    pub results: Vec<ExperimentResult>,
}

impl JobResult {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            backend_name: None,
            results: Vec::new(),
        }
    }

    pub fn with_result(mut self, result: ExperimentResult) -> Self {
        self.results.push(result);
        self
    }

    /// One record per circuit, tagged with `job_id` (defaults to the bundle's own id).
    pub fn to_records(&self, job_id: Option<&str>) -> ExpDataResult<Vec<Record>> {
        let job_id = job_id.unwrap_or(&self.job_id);
        self.results.iter().map(|r| r.to_record(job_id)).collect()
    }
}

/// Anything accepted by `ExperimentData::add_data`.
#[derive(Debug, Clone)]
pub enum DataPayload {
    Record(Record),
    Result(JobResult),
    /// Untyped JSON: an object, or an array of objects.
    Json(Value),
}

impl From<Record> for DataPayload {
    fn from(record: Record) -> Self {
        DataPayload::Record(record)
    }
}

impl From<JobResult> for DataPayload {
    fn from(result: JobResult) -> Self {
        DataPayload::Result(result)
    }
}

impl From<Value> for DataPayload {
    fn from(value: Value) -> Self {
        DataPayload::Json(value)
    }
}

/// Records contributed by a payload, plus the job id they originate from (if any).
pub(crate) struct Normalized {
    pub job_id: Option<String>,
    pub records: Vec<Record>,
}

impl DataPayload {
    pub(crate) fn normalize(self) -> ExpDataResult<Normalized> {
        match self {
            DataPayload::Record(record) => Ok(Normalized {
                job_id: None,
                records: vec![record],
            }),
            DataPayload::Result(result) => Ok(Normalized {
                records: result.to_records(None)?,
                job_id: Some(result.job_id),
            }),
            DataPayload::Json(Value::Object(record)) => Ok(Normalized {
                job_id: None,
                records: vec![record],
            }),
            DataPayload::Json(Value::Array(items)) => {
                let records = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(record) => Ok(record),
                        other => Err(ExpDataError::UnsupportedData(json_kind(&other).to_string())),
                    })
                    .collect::<ExpDataResult<Vec<_>>>()?;
                Ok(Normalized {
                    job_id: None,
                    records,
                })
            }
            DataPayload::Json(other) => {
                Err(ExpDataError::UnsupportedData(json_kind(&other).to_string()))
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_counts_from_hex() {
        let raw = obj(json!({"0x0": 10, "0x3": 5, "0x1": 1}));
        let counts = Counts::from_hex(&raw, Some(3)).unwrap();
        assert_eq!(counts.get("000"), 10);
        assert_eq!(counts.get("011"), 5);
        assert_eq!(counts.get("001"), 1);
        assert_eq!(counts.total_shots(), 16);
    }

    #[test]
    fn test_counts_bitstring_keys_pass_through() {
        let raw = obj(json!({"01": 7}));
        let counts = Counts::from_hex(&raw, None).unwrap();
        assert_eq!(counts.get("01"), 7);
    }

    #[test]
    fn test_counts_rejects_bad_values() {
        assert!(Counts::from_hex(&obj(json!({"0xZZ": 1})), None).is_err());
        assert!(Counts::from_hex(&obj(json!({"0x1": "many"})), None).is_err());
    }

    #[test]
    fn test_job_result_records() {
        let result = JobResult::new("job-a")
            .with_result(
                ExperimentResult::new(1024, 2)
                    .with_hex_counts(obj(json!({"0x1": 1000, "0x0": 24})))
                    .with_header(ResultHeader {
                        name: Some("circ-0".into()),
                        metadata: Some(obj(json!({"xval": 0.5}))),
                        memory_slots: Some(1),
                    }),
            )
            .with_result(ExperimentResult::new(512, 1).with_meas_return("avg"));

        let records = result.to_records(None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["job_id"], json!("job-a"));
        assert_eq!(records[0]["shots"], json!(1024));
        assert_eq!(records[0]["counts"], json!({"1": 1000, "0": 24}));
        assert_eq!(records[0]["metadata"], json!({"xval": 0.5}));
        assert!(records[0].get("meas_return").is_none());
        assert_eq!(records[1]["meas_level"], json!(1));
        assert_eq!(records[1]["meas_return"], json!("avg"));

        let retagged = result.to_records(Some("other")).unwrap();
        assert_eq!(retagged[1]["job_id"], json!("other"));
    }

    #[test]
    fn test_payload_shapes() {
        let ok = DataPayload::from(json!([{"a": 1}, {"b": 2}])).normalize().unwrap();
        assert_eq!(ok.records.len(), 2);
        assert!(ok.job_id.is_none());

        let err = DataPayload::from(json!(42)).normalize().err().unwrap();
        assert!(matches!(err, ExpDataError::UnsupportedData(kind) if kind == "number"));

        let err = DataPayload::from(json!([{"a": 1}, "x"])).normalize().err().unwrap();
        assert!(matches!(err, ExpDataError::UnsupportedData(_)));
    }
}
