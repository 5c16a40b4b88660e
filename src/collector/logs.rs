//! OTLP log records to `otel_logs` rows.

use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use serde_json::json;

use super::attributes::{attributes_to_map, attributes_with_scope, service_name, value_to_string};
use super::batch::{datetime64, Columns};

pub const TABLE: &str = "@@table_otel_logs@@";

pub const COLUMNS: &[&str] = &[
    "Timestamp",
    "TraceId",
    "SpanId",
    "TraceFlags",
    "SeverityText",
    "SeverityNumber",
    "ServiceName",
    "Body",
    "ResourceAttributes",
    "LogAttributes",
];

pub fn columns() -> Vec<Columns> {
    vec![Columns::new(TABLE, COLUMNS)]
}

/// Appends one row per log record; returns the number of records.
pub fn append(tables: &mut [Columns], req: &ExportLogsServiceRequest) -> usize {
    let cols = &mut tables[0];
    let mut count = 0;
    for rl in &req.resource_logs {
        let resource_attrs = rl
            .resource
            .as_ref()
            .map(|r| attributes_to_map(&r.attributes))
            .unwrap_or_default();
        let service = service_name(&resource_attrs);
        let resource_json = json!(resource_attrs);
        for sl in &rl.scope_logs {
            for lr in &sl.log_records {
                // records without an event time fall back to the observed time
                let ts = if lr.time_unix_nano > 0 {
                    lr.time_unix_nano
                } else {
                    lr.observed_time_unix_nano
                };
                cols.push(vec![
                    datetime64(ts),
                    hex::encode(&lr.trace_id).into(),
                    hex::encode(&lr.span_id).into(),
                    lr.flags.into(),
                    lr.severity_text.clone().into(),
                    lr.severity_number.into(),
                    service.clone().into(),
                    lr.body.as_ref().map(value_to_string).unwrap_or_default().into(),
                    resource_json.clone(),
                    json!(attributes_with_scope(&lr.attributes, sl.scope.as_ref())),
                ]);
                count += 1;
            }
        }
    }
    count
}
