use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

pub struct Pipeline<S, T, K> {
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>, // same-type transforms chain
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub fn new(source: S, sink: K) -> Self {
        Self {
            source,
            transforms: Vec::new(),
            sink,
        }
    }

    pub fn with_transform<X>(mut self, transform: X) -> Self
    where
        X: Transform<T, T> + 'static,
    {
        self.transforms.push(Arc::new(transform));
        self
    }

    /// Drive the source to completion.
    pub async fn run(self) -> Result<(), PipelineError> {
        let stream = self.source.stream().await;
        Self::drain(stream, self.transforms, self.sink).await
    }

    /// Drive the source until it ends or `cancel` fires. The sink still sees
    /// end-of-stream on cancellation and flushes what it has buffered, but
    /// items the source has not yet yielded are dropped. Sources that
    /// acknowledge items upstream should end their own stream on shutdown and
    /// be driven with [`run`](Self::run) instead.
    pub async fn run_until(self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let stream = self.source.stream().await;
        let stream: EnvelopeStream<T> = Box::pin(stream.take_until(cancel.cancelled_owned()));
        Self::drain(stream, self.transforms, self.sink).await
    }

    async fn drain(
        mut stream: EnvelopeStream<T>,
        transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>,
        sink: K,
    ) -> Result<(), PipelineError> {
        // Apply transforms in sequence (if any).
        for t in transforms {
            stream = Box::pin(stream.then(move |item| {
                let t = t.clone();
                async move {
                    match item {
                        Ok(env) => t.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            }));
        }

        sink.run(stream).await
    }
}
