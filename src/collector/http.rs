//! OTLP/HTTP receiver plus the `/metrics` and `/health` endpoints.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use opentelemetry_proto::tonic::collector::logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse};
use prost::Message;
use tracing::warn;

use super::decode::decode_body;
use super::profiles::Profile;
use super::Collector;
use crate::constants::API_KEY_HEADER;
use crate::error::CollectorError;
use crate::model::Project;
use crate::telemetry::metrics;

const PROTOBUF: &str = "application/x-protobuf";
const SERVICE_NAME_PARAM: &str = "service.name";

type HandlerResult = Result<(StatusCode, [(axum::http::HeaderName, &'static str); 1], Vec<u8>), (StatusCode, String)>;

pub fn router(collector: Arc<Collector>) -> Router {
    Router::new()
        .route("/v1/traces", post(traces))
        .route("/v1/logs", post(logs))
        .route("/v1/metrics", post(otlp_metrics))
        .route("/v1/profiles", post(profiles))
        .with_state(collector)
        .merge(status_router())
}

/// `/metrics` and `/health`, served with or without a collector.
pub fn status_router() -> Router {
    Router::new()
        .route("/metrics", get(prometheus))
        .route("/health", get(health))
}

pub fn status_code(e: &CollectorError) -> StatusCode {
    match e {
        CollectorError::UnknownApiKey => StatusCode::NOT_FOUND,
        CollectorError::Decode { .. } | CollectorError::UnsupportedEncoding { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: CollectorError) -> (StatusCode, String) {
    let code = status_code(&e);
    if code != StatusCode::NOT_FOUND {
        warn!(target: "cerebro::collector", error = %e, "rejected ingestion request");
    }
    (code, e.to_string())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default()
}

/// Resolves the project and returns the decompressed body.
fn prepare(c: &Collector, headers: &HeaderMap, body: &[u8]) -> Result<(Arc<Project>, Vec<u8>), CollectorError> {
    let project = c.get_project(header(headers, API_KEY_HEADER))?;
    let body = decode_body(header(headers, CONTENT_ENCODING.as_str()), body)?;
    Ok((project, body))
}

fn decode<M: Message + Default>(body: &[u8]) -> Result<M, CollectorError> {
    M::decode(body).map_err(|e| CollectorError::decode(e.to_string()))
}

fn protobuf(m: impl Message) -> HandlerResult {
    Ok((StatusCode::OK, [(CONTENT_TYPE, PROTOBUF)], m.encode_to_vec()))
}

async fn traces(State(c): State<Arc<Collector>>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (project, body) = prepare(&c, &headers, &body).map_err(reject)?;
    let req: ExportTraceServiceRequest = decode(&body).map_err(reject)?;
    c.ingest_traces(&project.id, &req).await;
    protobuf(ExportTraceServiceResponse::default())
}

async fn logs(State(c): State<Arc<Collector>>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (project, body) = prepare(&c, &headers, &body).map_err(reject)?;
    let req: ExportLogsServiceRequest = decode(&body).map_err(reject)?;
    c.ingest_logs(&project.id, &req).await;
    protobuf(ExportLogsServiceResponse::default())
}

async fn otlp_metrics(State(c): State<Arc<Collector>>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (project, body) = prepare(&c, &headers, &body).map_err(reject)?;
    let req: ExportMetricsServiceRequest = decode(&body).map_err(reject)?;
    c.ingest_metrics(&project.id, &req).await;
    protobuf(ExportMetricsServiceResponse::default())
}

/// Query parameters other than `service.name` that occur exactly once.
fn profile_labels(params: &[(String, String)]) -> BTreeMap<String, String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (k, _) in params {
        *counts.entry(k.as_str()).or_default() += 1;
    }
    params
        .iter()
        .filter(|(k, _)| k != SERVICE_NAME_PARAM && counts.get(k.as_str()) == Some(&1))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

async fn profiles(
    State(c): State<Arc<Collector>>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let service_name = params
        .iter()
        .find(|(k, _)| k == SERVICE_NAME_PARAM)
        .map(|(_, v)| v.as_str())
        .unwrap_or_default();
    if service_name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, format!("{SERVICE_NAME_PARAM} is required")));
    }
    let (project, body) = prepare(&c, &headers, &body).map_err(reject)?;
    let profile = Profile::parse(&body).map_err(reject)?;
    c.ingest_profile(&project.id, service_name, &profile_labels(&params), &profile)
        .await;
    Ok(StatusCode::OK)
}

async fn prometheus() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics().render(),
    )
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{collector, project, MemoryStorage};
    use crate::collector::{logs as log_rows, profiles as profile_rows, traces as trace_rows};
    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tower::ServiceExt;

    async fn setup() -> (Router, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::default());
        let c = collector(vec![project("p1", &["k1"]), project("p2", &["k2"])], storage.clone());
        assert!(c.migrate_pending().await);
        (router(c), storage)
    }

    fn post_req(uri: &str, key: &str, encoding: &str, body: Vec<u8>) -> Request<Body> {
        let mut b = Request::post(uri).header(CONTENT_TYPE, PROTOBUF);
        if !key.is_empty() {
            b = b.header(API_KEY_HEADER, key);
        }
        if !encoding.is_empty() {
            b = b.header(CONTENT_ENCODING, encoding);
        }
        b.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_traces_are_routed_by_api_key() {
        let (app, storage) = setup().await;
        let body = trace_rows::tests::request().encode_to_vec();
        let resp = app
            .oneshot(post_req("/v1/traces", "k2", "", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], PROTOBUF);
        assert_eq!(storage.tables(), vec![("p2".to_string(), trace_rows::TABLE.to_string())]);
    }

    #[tokio::test]
    async fn test_gzip_logs() {
        let (app, storage) = setup().await;
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(&log_rows::tests::request().encode_to_vec()).unwrap();
        let resp = app
            .oneshot(post_req("/v1/logs", "k1", "gzip", gz.finish().unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(storage.tables(), vec![("p1".to_string(), log_rows::TABLE.to_string())]);
    }

    #[tokio::test]
    async fn test_rejections() {
        let (app, storage) = setup().await;
        let body = trace_rows::tests::request().encode_to_vec();

        let resp = app
            .clone()
            .oneshot(post_req("/v1/traces", "unknown", "", body.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // two projects and none named default
        let resp = app
            .clone()
            .oneshot(post_req("/v1/traces", "", "", body.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(post_req("/v1/traces", "k1", "br", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post_req("/v1/logs", "k1", "", vec![0xff, 0xff, 0xff]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(storage.tables().is_empty());
    }

    #[tokio::test]
    async fn test_profiles() {
        let (app, storage) = setup().await;
        let body = profile_rows::tests::profile().encode_to_vec();

        let resp = app
            .clone()
            .oneshot(post_req("/v1/profiles?env=prod", "k1", "", body.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post_req("/v1/profiles?service.name=checkout&env=prod", "k1", "", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let tables: Vec<String> = storage.tables().into_iter().map(|(_, t)| t).collect();
        assert_eq!(tables, vec![profile_rows::STACKS_TABLE, profile_rows::SAMPLES_TABLE]);
    }

    #[test]
    fn test_profile_labels() {
        let params: Vec<(String, String)> = [("service.name", "api"), ("env", "prod"), ("tag", "a"), ("tag", "b")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let labels = profile_labels(&params);
        assert_eq!(labels, [("env".to_string(), "prod".to_string())].into());
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (app, _) = setup().await;
        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("cerebro_cache_chunks_written_total"));
    }
}
