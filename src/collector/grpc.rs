//! OTLP/gRPC trace, logs and metrics services.

use std::net::SocketAddr;
use std::sync::Arc;

use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{LogsService, LogsServiceServer};
use opentelemetry_proto::tonic::collector::logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::{TraceService, TraceServiceServer};
use opentelemetry_proto::tonic::collector::trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;

use super::Collector;
use crate::constants::API_KEY_HEADER;
use crate::error::{CollectorError, NetworkError};
use crate::model::Project;

#[derive(Clone)]
pub struct OtlpService {
    collector: Arc<Collector>,
}

impl OtlpService {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self { collector }
    }

    fn project<T>(&self, req: &Request<T>) -> Result<Arc<Project>, Status> {
        let key = req
            .metadata()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        self.collector.get_project(key).map_err(to_status)
    }
}

fn to_status(e: CollectorError) -> Status {
    match e {
        CollectorError::UnknownApiKey => Status::not_found(e.to_string()),
        CollectorError::Decode { .. } | CollectorError::UnsupportedEncoding { .. } => {
            Status::invalid_argument(e.to_string())
        }
        _ => Status::internal(e.to_string()),
    }
}

#[tonic::async_trait]
impl TraceService for OtlpService {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let project = self.project(&request)?;
        self.collector
            .ingest_traces(&project.id, request.get_ref())
            .await;
        Ok(Response::new(ExportTraceServiceResponse::default()))
    }
}

#[tonic::async_trait]
impl LogsService for OtlpService {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let project = self.project(&request)?;
        self.collector.ingest_logs(&project.id, request.get_ref()).await;
        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}

#[tonic::async_trait]
impl MetricsService for OtlpService {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let project = self.project(&request)?;
        self.collector
            .ingest_metrics(&project.id, request.get_ref())
            .await;
        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}

/// Serves the OTLP services until `shutdown` is cancelled.
pub async fn serve(collector: Arc<Collector>, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), NetworkError> {
    let svc = OtlpService::new(collector);
    info!(target: "cerebro::collector", %addr, "otlp grpc listening");
    tonic::transport::Server::builder()
        .add_service(TraceServiceServer::new(svc.clone()))
        .add_service(LogsServiceServer::new(svc.clone()))
        .add_service(MetricsServiceServer::new(svc))
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await
        .map_err(|e| NetworkError::Serve {
            addr: addr.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{collector, project, MemoryStorage};
    use crate::collector::{logs, traces};
    use pretty_assertions::assert_eq;

    fn with_key<T>(msg: T, key: &str) -> Request<T> {
        let mut req = Request::new(msg);
        if let Ok(v) = key.parse() {
            req.metadata_mut().insert(API_KEY_HEADER, v);
        }
        req
    }

    #[tokio::test]
    async fn test_export() {
        let storage = Arc::new(MemoryStorage::default());
        let c = collector(vec![project("p1", &["k1"]), project("p2", &["k2"])], storage.clone());
        assert!(c.migrate_pending().await);
        let svc = OtlpService::new(c);

        TraceService::export(&svc, with_key(traces::tests::request(), "k1"))
            .await
            .unwrap();
        LogsService::export(&svc, with_key(logs::tests::request(), "k2"))
            .await
            .unwrap();
        assert_eq!(
            storage.tables(),
            vec![
                ("p1".to_string(), traces::TABLE.to_string()),
                ("p2".to_string(), logs::TABLE.to_string())
            ]
        );

        let err = TraceService::export(&svc, with_key(traces::tests::request(), "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(to_status(CollectorError::decode("bad")).code(), tonic::Code::InvalidArgument);
        assert_eq!(to_status(CollectorError::clickhouse("down")).code(), tonic::Code::Internal);
    }
}
