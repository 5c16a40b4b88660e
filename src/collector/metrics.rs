//! OTLP gauges and sums to `metrics` samples and `metrics_metadata` rows.
//!
//! Every number data point becomes one sample labelled with the resource and
//! data point attributes. Histograms and summaries are skipped.

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value as PointValue;
use opentelemetry_proto::tonic::metrics::v1::NumberDataPoint;
use serde_json::{json, Value};

use super::attributes::{attributes_to_map, AttributeMap};
use super::batch::Columns;
use crate::model::{labels_hash, Labels};

pub const TABLE: &str = "@@table_metrics@@";
pub const METADATA_TABLE: &str = "@@table_metrics_metadata@@";

pub const COLUMNS: &[&str] = &["MetricName", "Labels", "Timestamp", "MetricHash", "Value"];
pub const METADATA_COLUMNS: &[&str] = &["MetricFamilyName", "Type", "Help", "Unit"];

const METRIC_NAME_LABEL: &str = "__name__";

pub fn columns() -> Vec<Columns> {
    vec![
        Columns::new(TABLE, COLUMNS),
        Columns::new(METADATA_TABLE, METADATA_COLUMNS),
    ]
}

/// Prometheus-compatible label name: anything but `[A-Za-z0-9_]` becomes `_`.
pub fn normalize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// `DateTime64(3)` literal, truncated to the second.
fn timestamp_seconds(nanos: u64) -> Value {
    Value::String(format!("{}.000", nanos / 1_000_000_000))
}

fn point_value(p: &NumberDataPoint) -> Option<f64> {
    match p.value.as_ref()? {
        PointValue::AsDouble(d) => Some(*d),
        PointValue::AsInt(i) => Some(*i as f64),
    }
}

/// Appends samples and metadata; returns the number of samples.
pub fn append(tables: &mut [Columns], req: &ExportMetricsServiceRequest) -> usize {
    let mut count = 0;
    for rm in &req.resource_metrics {
        let resource_attrs = rm
            .resource
            .as_ref()
            .map(|r| attributes_to_map(&r.attributes))
            .unwrap_or_default();
        for sm in &rm.scope_metrics {
            for metric in &sm.metrics {
                let (kind, points) = match &metric.data {
                    Some(Data::Gauge(g)) => ("GAUGE", &g.data_points),
                    Some(Data::Sum(s)) if s.is_monotonic => ("COUNTER", &s.data_points),
                    Some(Data::Sum(s)) => ("GAUGE", &s.data_points),
                    _ => continue,
                };
                tables[1].push(vec![
                    metric.name.clone().into(),
                    kind.into(),
                    metric.description.clone().into(),
                    metric.unit.clone().into(),
                ]);
                for p in points {
                    let Some(v) = point_value(p) else {
                        continue;
                    };
                    let labels = sample_labels(&resource_attrs, &attributes_to_map(&p.attributes));
                    let mut with_name = labels.clone();
                    with_name.insert(METRIC_NAME_LABEL.to_string(), metric.name.clone());
                    tables[0].push(vec![
                        metric.name.clone().into(),
                        json!(labels),
                        timestamp_seconds(p.time_unix_nano),
                        labels_hash(&with_name).into(),
                        v.into(),
                    ]);
                    count += 1;
                }
            }
        }
    }
    count
}

/// Resource attributes overridden by data point attributes, normalized and
/// sorted.
fn sample_labels(resource: &AttributeMap, point: &AttributeMap) -> Labels {
    resource
        .iter()
        .chain(point.iter())
        .map(|(k, v)| (normalize_label_name(k), v.clone()))
        .filter(|(k, _)| k != METRIC_NAME_LABEL)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::attributes::tests::kv;
    use opentelemetry_proto::tonic::common::v1::any_value::Value as AttrValue;
    use opentelemetry_proto::tonic::metrics::v1::{
        Gauge, Histogram, Metric, ResourceMetrics, ScopeMetrics, Sum,
    };
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use pretty_assertions::assert_eq;

    fn point(ts: u64, v: PointValue, attrs: Vec<opentelemetry_proto::tonic::common::v1::KeyValue>) -> NumberDataPoint {
        NumberDataPoint {
            time_unix_nano: ts,
            value: Some(v),
            attributes: attrs,
            ..Default::default()
        }
    }

    fn request() -> ExportMetricsServiceRequest {
        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(Resource {
                    attributes: vec![kv("service.name", AttrValue::StringValue("api".into()))],
                    ..Default::default()
                }),
                scope_metrics: vec![ScopeMetrics {
                    metrics: vec![
                        Metric {
                            name: "queue_size".into(),
                            description: "Items waiting".into(),
                            data: Some(Data::Gauge(Gauge {
                                data_points: vec![point(
                                    1_700_000_000_500_000_000,
                                    PointValue::AsInt(3),
                                    vec![kv("queue", AttrValue::StringValue("emails".into()))],
                                )],
                            })),
                            ..Default::default()
                        },
                        Metric {
                            name: "requests_total".into(),
                            unit: "1".into(),
                            data: Some(Data::Sum(Sum {
                                data_points: vec![point(1_700_000_000_000_000_000, PointValue::AsDouble(10.5), vec![])],
                                is_monotonic: true,
                                ..Default::default()
                            })),
                            ..Default::default()
                        },
                        Metric {
                            name: "latency".into(),
                            data: Some(Data::Histogram(Histogram::default())),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_samples_and_metadata() {
        let mut tables = columns();
        assert_eq!(append(&mut tables, &request()), 2);
        let meta = tables.pop().unwrap();
        let samples: Value = serde_json::from_slice(&tables.pop().unwrap().into_json()).unwrap();
        let meta: Value = serde_json::from_slice(&meta.into_json()).unwrap();

        assert_eq!(samples["MetricName"], json!(["queue_size", "requests_total"]));
        assert_eq!(samples["Labels"][0], json!({"queue": "emails", "service_name": "api"}));
        assert_eq!(samples["Timestamp"], json!(["1700000000.000", "1700000000.000"]));
        assert_eq!(samples["Value"], json!([3.0, 10.5]));
        assert_eq!(meta["Type"], json!(["GAUGE", "COUNTER"]));
        assert_eq!(meta["Help"], json!(["Items waiting", ""]));
        assert_eq!(meta["Unit"], json!(["", "1"]));
    }

    #[test]
    fn test_metric_hash_includes_name() {
        let labels: Labels = [("service_name".to_string(), "api".to_string())].into();
        let mut with_name = labels.clone();
        with_name.insert(METRIC_NAME_LABEL.into(), "requests_total".into());
        let mut tables = columns();
        append(&mut tables, &request());
        let samples: Value = serde_json::from_slice(&tables.remove(0).into_json()).unwrap();
        assert_eq!(samples["MetricHash"][1], json!(labels_hash(&with_name)));
        assert_ne!(labels_hash(&labels), labels_hash(&with_name));
    }

    #[test]
    fn test_normalize_label_name() {
        assert_eq!(normalize_label_name("k8s.pod.name"), "k8s_pod_name");
        assert_eq!(normalize_label_name("http_method"), "http_method");
    }
}
