//! OTLP spans to `otel_traces` rows.

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use serde_json::{json, Value};

use super::attributes::{attributes_to_map, attributes_with_scope, service_name};
use super::batch::{datetime64, Columns};

pub const TABLE: &str = "@@table_otel_traces@@";

pub const COLUMNS: &[&str] = &[
    "Timestamp",
    "TraceId",
    "SpanId",
    "ParentSpanId",
    "TraceState",
    "SpanName",
    "SpanKind",
    "ServiceName",
    "ResourceAttributes",
    "SpanAttributes",
    "Duration",
    "StatusCode",
    "StatusMessage",
    "Events.Timestamp",
    "Events.Name",
    "Events.Attributes",
    "Links.TraceId",
    "Links.SpanId",
    "Links.TraceState",
    "Links.Attributes",
];

pub fn columns() -> Vec<Columns> {
    vec![Columns::new(TABLE, COLUMNS)]
}

/// Appends one row per span; returns the number of spans.
pub fn append(tables: &mut [Columns], req: &ExportTraceServiceRequest) -> usize {
    let cols = &mut tables[0];
    let mut count = 0;
    for rs in &req.resource_spans {
        let resource_attrs = rs
            .resource
            .as_ref()
            .map(|r| attributes_to_map(&r.attributes))
            .unwrap_or_default();
        let service = service_name(&resource_attrs);
        let resource_json = json!(resource_attrs);
        for ss in &rs.scope_spans {
            for span in &ss.spans {
                let span_attrs = attributes_with_scope(&span.attributes, ss.scope.as_ref());
                let (status_code, status_message) = match &span.status {
                    Some(s) => (s.code().as_str_name(), s.message.clone()),
                    None => ("STATUS_CODE_UNSET", String::new()),
                };
                let duration = span.end_time_unix_nano.saturating_sub(span.start_time_unix_nano) as i64;

                let events = &span.events;
                let links = &span.links;
                cols.push(vec![
                    datetime64(span.start_time_unix_nano),
                    hex::encode(&span.trace_id).into(),
                    hex::encode(&span.span_id).into(),
                    hex::encode(&span.parent_span_id).into(),
                    span.trace_state.clone().into(),
                    span.name.clone().into(),
                    span.kind().as_str_name().into(),
                    service.clone().into(),
                    resource_json.clone(),
                    json!(span_attrs),
                    duration.into(),
                    status_code.into(),
                    status_message.into(),
                    Value::Array(events.iter().map(|e| datetime64(e.time_unix_nano)).collect()),
                    Value::Array(events.iter().map(|e| e.name.clone().into()).collect()),
                    Value::Array(events.iter().map(|e| json!(attributes_to_map(&e.attributes))).collect()),
                    Value::Array(links.iter().map(|l| hex::encode(&l.trace_id).into()).collect()),
                    Value::Array(links.iter().map(|l| hex::encode(&l.span_id).into()).collect()),
                    Value::Array(links.iter().map(|l| l.trace_state.clone().into()).collect()),
                    Value::Array(links.iter().map(|l| json!(attributes_to_map(&l.attributes))).collect()),
                ]);
                count += 1;
            }
        }
    }
    count
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collector::attributes::tests::kv;
    use opentelemetry_proto::tonic::common::v1::any_value::Value as AttrValue;
    use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::span::{Event, Link, SpanKind};
    use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span, Status};
    use pretty_assertions::assert_eq;

    pub(crate) fn request() -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![kv("service.name", AttrValue::StringValue("checkout".into()))],
                    ..Default::default()
                }),
                scope_spans: vec![ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: "otelhttp".into(),
                        version: "0.45.0".into(),
                        ..Default::default()
                    }),
                    spans: vec![Span {
                        trace_id: vec![0xab; 16],
                        span_id: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
                        name: "GET /cart".into(),
                        kind: SpanKind::Server as i32,
                        start_time_unix_nano: 1_700_000_000_000_000_000,
                        end_time_unix_nano: 1_700_000_000_250_000_000,
                        attributes: vec![kv("http.status_code", AttrValue::IntValue(200))],
                        events: vec![Event {
                            time_unix_nano: 1_700_000_000_100_000_000,
                            name: "exception".into(),
                            ..Default::default()
                        }],
                        links: vec![Link {
                            trace_id: vec![0xcd; 16],
                            span_id: vec![0xef; 8],
                            ..Default::default()
                        }],
                        status: Some(Status {
                            message: String::new(),
                            code: StatusCode::Ok as i32,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_span_row() {
        let mut tables = columns();
        assert_eq!(append(&mut tables, &request()), 1);
        let json: Value = serde_json::from_slice(&tables.remove(0).into_json()).unwrap();

        assert_eq!(json["Timestamp"], json!(["1700000000.000000000"]));
        assert_eq!(json["TraceId"], json!(["abababababababababababababababab"]));
        assert_eq!(json["SpanId"], json!(["0102030405060708"]));
        assert_eq!(json["ParentSpanId"], json!([""]));
        assert_eq!(json["SpanKind"], json!(["SPAN_KIND_SERVER"]));
        assert_eq!(json["ServiceName"], json!(["checkout"]));
        assert_eq!(json["Duration"], json!([250_000_000]));
        assert_eq!(json["StatusCode"], json!(["STATUS_CODE_OK"]));
        assert_eq!(
            json["SpanAttributes"],
            json!([{"http.status_code": "200", "otel.scope.name": "otelhttp", "otel.scope.version": "0.45.0"}])
        );
        assert_eq!(json["Events.Name"], json!([["exception"]]));
        assert_eq!(json["Events.Timestamp"], json!([["1700000000.100000000"]]));
        assert_eq!(json["Links.SpanId"], json!([["efefefefefefefef"]]));
        assert_eq!(json["Links.Attributes"], json!([[{}]]));
    }
}
