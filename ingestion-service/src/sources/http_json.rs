use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use telemetry_engine::domain::MeterReading;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<MeterReading>>,
    max_request_records: usize,
    closing: CancellationToken,
}

/// Collector-facing `POST /ingest/readings` endpoint. Each request body is a
/// JSON array of readings, queued on a bounded channel for the pipeline.
///
/// Once `shutdown` fires, new requests get 503 and the listener stops. The
/// stream ends after every reading already acknowledged has been yielded.
#[derive(Clone)]
pub struct HttpJsonSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<MeterReading>>>>>,
}

impl HttpJsonSource {
    pub async fn new(
        bind_addr: &str,
        channel_capacity: usize,
        max_request_records: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PipelineError::Source(format!("failed to bind HTTP JSON source listener on {addr}: {e}")))?;

        let (source, app) = Self::with_router(channel_capacity, max_request_records, shutdown.clone());
        tracing::info!(%addr, "reading ingest endpoint listening");

        tokio::spawn(async move {
            let served = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            match served {
                Ok(()) => tracing::info!(%addr, "reading ingest endpoint stopped"),
                Err(e) => tracing::error!(error = %e, "HTTP JSON source server error"),
            }
        });

        Ok(source)
    }

    /// The source together with its unbound router. The stream ends once the
    /// router and every clone of it are dropped.
    pub fn with_router(
        channel_capacity: usize,
        max_request_records: usize,
        shutdown: CancellationToken,
    ) -> (Self, Router) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let shared = SharedSender {
            tx,
            max_request_records,
            closing: shutdown,
        };

        let app = Router::new()
            .route("/ingest/readings", post(ingest_readings))
            .with_state(shared);

        let source = Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        };
        (source, app)
    }
}

#[async_trait::async_trait]
impl Source<MeterReading> for HttpJsonSource {
    async fn stream(&self) -> EnvelopeStream<MeterReading> {
        let mut guard = self.receiver.lock().await;
        match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(futures::stream::once(async {
                Err(PipelineError::Source(
                    "HttpJsonSource stream already taken; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}

async fn ingest_readings(
    State(sender): State<SharedSender>,
    Json(payload): Json<Vec<MeterReading>>,
) -> (StatusCode, Json<Value>) {
    metrics::counter!("http_ingest_requests_total").increment(1);

    if sender.closing.is_cancelled() {
        return closed();
    }

    if payload.len() > sender.max_request_records {
        metrics::counter!("http_ingest_failed_total").increment(1);
        let status = StatusCode::PAYLOAD_TOO_LARGE;
        let body = json!({
            "error": format!("at most {} readings per request", sender.max_request_records),
            "status": status.as_u16(),
        });
        return (status, Json(body));
    }

    let queued = payload.len();
    for reading in payload {
        if sender.tx.send(Envelope::now(reading)).await.is_err() {
            return closed();
        }
    }

    metrics::counter!("http_ingest_readings_total").increment(queued as u64);
    (StatusCode::ACCEPTED, Json(json!({ "queued": queued })))
}

fn closed() -> (StatusCode, Json<Value>) {
    metrics::counter!("http_ingest_failed_total").increment(1);
    let status = StatusCode::SERVICE_UNAVAILABLE;
    let body = json!({ "error": "ingestion pipeline is not running", "status": status.as_u16() });
    (status, Json(body))
}
