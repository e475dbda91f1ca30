use crate::error::PipelineError;
use crate::health::HealthReport;
use crate::ingest::Ingestor;
use crate::orchestrator::Orchestrator;
use anyhow::Result;
use std::path::Path;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("telemetry.etl");
}

use proto::pipeline_server::{Pipeline, PipelineServer};
use proto::{
    HealthRequest, HealthResponse, PushReadingsRequest, PushReadingsResponse, RunCycleResponse,
};

/// Local control surface: health, raw reading injection and on-demand cycles.
#[derive(Clone)]
pub struct PipelineService {
    ingestor: Ingestor,
    orchestrator: Orchestrator,
}

impl PipelineService {
    pub fn new(ingestor: Ingestor, orchestrator: Orchestrator) -> Self {
        Self {
            ingestor,
            orchestrator,
        }
    }
}

fn to_health(report: &HealthReport) -> HealthResponse {
    let metrics = &report.metrics;
    HealthResponse {
        pipeline_status: report.pipeline_status.as_str().to_string(),
        store_reachable: report.store_reachable,
        queue_depth: report.queue_depth as u64,
        queue_capacity: report.queue_capacity as u64,
        records_processed: metrics.records_processed,
        records_failed: metrics.records_failed,
        readings_malformed: metrics.readings_malformed,
        errors_count: metrics.errors_count,
        predictions_emitted: metrics.predictions_emitted,
        alerts_emitted: metrics.alerts_emitted,
        success_rate: report.success_rate,
        average_cycle_ms: metrics.average_cycle_ms,
        last_cycle_unix_ms: metrics
            .last_cycle_at
            .map(|at| at.timestamp_millis())
            .unwrap_or_default(),
        quality_checks_failed: report.quality_checks_failed as u64,
        uptime_hours: report.uptime_hours,
        generated_at: report.generated_at.to_rfc3339(),
        build: env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[tonic::async_trait]
impl Pipeline for PipelineService {
    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let report = self.orchestrator.health().snapshot().await;
        Ok(Response::new(to_health(&report)))
    }

    async fn push_readings(
        &self,
        request: Request<PushReadingsRequest>,
    ) -> Result<Response<PushReadingsResponse>, Status> {
        let payload = request.into_inner();
        let mut response = PushReadingsResponse::default();

        for reading in payload.readings {
            let mut bytes = reading.payload;
            match self.ingestor.ingest_reading(&reading.topic, &mut bytes) {
                Ok(_) => response.accepted += 1,
                Err(PipelineError::MalformedReading(_)) => response.malformed += 1,
                Err(PipelineError::QueueOverflow { .. }) => response.dropped += 1,
                Err(err) => return Err(Status::internal(err.to_string())),
            }
        }
        response.queue_depth = self.ingestor.queue().len() as u64;
        Ok(Response::new(response))
    }

    async fn run_cycle(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<RunCycleResponse>, Status> {
        let outcome = self.orchestrator.run_cycle().await;
        Ok(Response::new(RunCycleResponse {
            outcome: outcome.label().to_string(),
            window_len: outcome.window_len() as u64,
            pipeline_status: self.orchestrator.status().as_str().to_string(),
        }))
    }
}

pub async fn serve_uds(
    socket_path: &str,
    service: PipelineService,
    cancel: CancellationToken,
) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<PipelineServer<PipelineService>>()
        .await;

    let incoming = UnixListenerStream::new(uds);
    tracing::info!(socket = socket_path, "gRPC control surface listening");

    Server::builder()
        .add_service(health_service)
        .add_service(PipelineServer::new(service))
        .serve_with_incoming_shutdown(incoming, async move { cancel.cancelled().await })
        .await?;

    tokio::fs::remove_file(socket_path).await.ok();
    Ok(())
}
