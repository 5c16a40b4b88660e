//! pprof profiles to `profiling_stacks` and `profiling_samples` rows.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::io::Read;

use fnv::FnvHasher;
use prost::Message;
use serde_json::{json, Value};

use super::batch::{datetime64, Columns};
use super::decode::is_gzip;
use crate::error::CollectorError;

pub const STACKS_TABLE: &str = "@@table_profiling_stacks@@";
pub const SAMPLES_TABLE: &str = "@@table_profiling_samples@@";

pub const STACKS_COLUMNS: &[&str] = &["ServiceName", "Hash", "LastSeen", "Stack"];
pub const SAMPLES_COLUMNS: &[&str] = &["ServiceName", "Type", "Start", "End", "Labels", "StackHash", "Value"];

pub fn columns() -> Vec<Columns> {
    vec![
        Columns::new(STACKS_TABLE, STACKS_COLUMNS),
        Columns::new(SAMPLES_TABLE, SAMPLES_COLUMNS),
    ]
}

// ----------------------------------------------------------------------------
// pprof wire format (profile.proto), the fields we read
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct Profile {
    #[prost(message, repeated, tag = "1")]
    pub sample_type: Vec<ValueType>,
    #[prost(message, repeated, tag = "2")]
    pub sample: Vec<Sample>,
    #[prost(message, repeated, tag = "4")]
    pub location: Vec<Location>,
    #[prost(message, repeated, tag = "5")]
    pub function: Vec<Function>,
    #[prost(string, repeated, tag = "6")]
    pub string_table: Vec<String>,
    #[prost(int64, tag = "9")]
    pub time_nanos: i64,
    #[prost(int64, tag = "10")]
    pub duration_nanos: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueType {
    #[prost(int64, tag = "1")]
    pub r#type: i64,
    #[prost(int64, tag = "2")]
    pub unit: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(uint64, repeated, tag = "1")]
    pub location_id: Vec<u64>,
    #[prost(int64, repeated, tag = "2")]
    pub value: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Location {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, repeated, tag = "4")]
    pub line: Vec<Line>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Line {
    #[prost(uint64, tag = "1")]
    pub function_id: u64,
    #[prost(int64, tag = "2")]
    pub line: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Function {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(int64, tag = "2")]
    pub name: i64,
    #[prost(int64, tag = "3")]
    pub system_name: i64,
    #[prost(int64, tag = "4")]
    pub filename: i64,
}

impl Profile {
    /// Decodes a pprof body, gunzipping it first if needed.
    pub fn parse(body: &[u8]) -> Result<Self, CollectorError> {
        if is_gzip(body) {
            let mut raw = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut raw)
                .map_err(|e| CollectorError::decode(format!("pprof: {e}")))?;
            return Profile::decode(raw.as_slice()).map_err(|e| CollectorError::decode(format!("pprof: {e}")));
        }
        Profile::decode(body).map_err(|e| CollectorError::decode(format!("pprof: {e}")))
    }

    fn string(&self, idx: i64) -> &str {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.string_table.get(i))
            .map_or("", String::as_str)
    }

    /// `"{function} {file}:{line}"` for every line of every location of the
    /// sample, leaf first.
    fn stack(
        &self,
        sample: &Sample,
        locations: &HashMap<u64, &Location>,
        functions: &HashMap<u64, &Function>,
    ) -> Vec<String> {
        let mut stack = Vec::new();
        for id in &sample.location_id {
            let Some(location) = locations.get(id) else {
                continue;
            };
            for line in &location.line {
                let Some(f) = functions.get(&line.function_id) else {
                    continue;
                };
                stack.push(format!("{} {}:{}", self.string(f.name), self.string(f.filename), line.line));
            }
        }
        stack
    }
}

/// FNV-1a 64 over the concatenated stack lines.
pub fn stack_hash(stack: &[String]) -> u64 {
    let mut h = FnvHasher::default();
    for l in stack {
        h.write(l.as_bytes());
    }
    h.finish()
}

/// Appends one stack row and one sample row per sample and non-empty sample
/// type; returns the number of samples.
pub fn append(tables: &mut [Columns], service_name: &str, labels: &BTreeMap<String, String>, p: &Profile) -> usize {
    let end = p.time_nanos.max(0) as u64;
    let start = end.saturating_sub(p.duration_nanos.max(0) as u64);
    let locations: HashMap<u64, &Location> = p.location.iter().map(|l| (l.id, l)).collect();
    let functions: HashMap<u64, &Function> = p.function.iter().map(|f| (f.id, f)).collect();
    let labels_json = json!(labels);

    let mut count = 0;
    for (i, st) in p.sample_type.iter().enumerate() {
        let typ = p.string(st.r#type);
        if typ.is_empty() {
            continue;
        }
        for s in &p.sample {
            let stack = p.stack(s, &locations, &functions);
            let hash = stack_hash(&stack);
            let value = s.value.get(i).copied().unwrap_or(0);
            tables[0].push(vec![
                service_name.into(),
                hash.into(),
                datetime64(end),
                Value::Array(stack.into_iter().map(Value::String).collect()),
            ]);
            tables[1].push(vec![
                service_name.into(),
                typ.into(),
                datetime64(start),
                datetime64(end),
                labels_json.clone(),
                hash.into(),
                value.into(),
            ]);
            count += 1;
        }
    }
    count
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    pub(crate) fn profile() -> Profile {
        let strings = ["", "cpu", "nanoseconds", "samples", "count", "main.work", "main.go", "runtime.main", "proc.go"];
        Profile {
            sample_type: vec![
                ValueType { r#type: 3, unit: 4 },
                ValueType { r#type: 1, unit: 2 },
                ValueType { r#type: 0, unit: 0 },
            ],
            sample: vec![Sample {
                location_id: vec![1, 2],
                value: vec![7, 70_000_000, 0],
            }],
            location: vec![
                Location {
                    id: 1,
                    line: vec![Line {
                        function_id: 1,
                        line: 42,
                    }],
                },
                Location {
                    id: 2,
                    line: vec![
                        Line {
                            function_id: 2,
                            line: 250,
                        },
                        Line {
                            function_id: 99,
                            line: 1,
                        },
                    ],
                },
            ],
            function: vec![
                Function {
                    id: 1,
                    name: 5,
                    system_name: 5,
                    filename: 6,
                },
                Function {
                    id: 2,
                    name: 7,
                    system_name: 7,
                    filename: 8,
                },
            ],
            string_table: strings.iter().map(|s| s.to_string()).collect(),
            time_nanos: 1_700_000_010_000_000_000,
            duration_nanos: 10_000_000_000,
        }
    }

    #[test]
    fn test_parse_plain_and_gzip() {
        let raw = profile().encode_to_vec();
        assert_eq!(Profile::parse(&raw).unwrap(), profile());

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(&raw).unwrap();
        assert_eq!(Profile::parse(&gz.finish().unwrap()).unwrap(), profile());

        assert!(matches!(Profile::parse(&[0xff, 0xff, 0xff]), Err(CollectorError::Decode { .. })));
    }

    #[test]
    fn test_stack_hash() {
        // FNV-1a 64 offset basis
        assert_eq!(stack_hash(&[]), 0xcbf29ce484222325);
        let joined = stack_hash(&["ab".to_string()]);
        assert_eq!(stack_hash(&["a".to_string(), "b".to_string()]), joined);
    }

    #[test]
    fn test_rows() {
        let labels: BTreeMap<String, String> = [("env".to_string(), "prod".to_string())].into();
        let mut tables = columns();
        assert_eq!(append(&mut tables, "checkout", &labels, &profile()), 2);

        let samples: Value = serde_json::from_slice(&tables.pop().unwrap().into_json()).unwrap();
        let stacks: Value = serde_json::from_slice(&tables.pop().unwrap().into_json()).unwrap();
        let expected_stack = vec!["main.work main.go:42".to_string(), "runtime.main proc.go:250".to_string()];

        assert_eq!(stacks["Stack"][0], json!(expected_stack));
        assert_eq!(stacks["Hash"][0], json!(stack_hash(&expected_stack)));
        assert_eq!(stacks["LastSeen"][0], json!("1700000010.000000000"));
        assert_eq!(samples["Type"], json!(["samples", "cpu"]));
        assert_eq!(samples["Value"], json!([7, 70_000_000]));
        assert_eq!(samples["Start"][0], json!("1700000000.000000000"));
        assert_eq!(samples["Labels"][1], json!({"env": "prod"}));
    }
}
