use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::events::{SubmissionEvent, SUBMITTED_SUBJECT};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to set up stream {stream}: {message}")]
    Stream { stream: String, message: String },

    #[error("Failed to set up consumer {consumer}: {message}")]
    Consumer { consumer: String, message: String },

    #[error("Failed to pull messages: {0}")]
    Messages(String),
}

/// Receives decoded submissions. An `Err` asks the broker to redeliver.
#[async_trait]
pub trait SubmissionHandler: Send + Sync {
    async fn handle(&self, event: SubmissionEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub stream: String,
    /// Durable consumer name; every instance using it shares the workload.
    pub queue_group: String,
    pub max_concurrent: usize,
    pub ack_wait: Duration,
    pub max_deliver: i64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            stream: "resume-processing".to_string(),
            queue_group: "resume-parser".to_string(),
            max_concurrent: 8,
            ack_wait: Duration::from_secs(15 * 60),
            max_deliver: 5,
        }
    }
}

/// What to tell the broker about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Redeliver later.
    Nak,
    /// Never redeliver; the payload can not be processed.
    Term,
}

impl Disposition {
    fn ack_kind(self) -> AckKind {
        match self {
            Disposition::Ack => AckKind::Ack,
            Disposition::Nak => AckKind::Nak(None),
            Disposition::Term => AckKind::Term,
        }
    }
}

/// Decodes one payload and runs the handler to completion.
pub async fn dispatch(handler: &dyn SubmissionHandler, payload: &[u8]) -> Disposition {
    let event: SubmissionEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            error!("Dropping undecodable submission ({} bytes): {e}", payload.len());
            return Disposition::Term;
        }
    };

    match handler.handle(event).await {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            warn!("Submission handling failed, requesting redelivery: {e:#}");
            Disposition::Nak
        }
    }
}

/// Durable, queue-grouped JetStream subscription to `job.resume.submitted`.
pub struct SubmissionListener {
    jetstream: jetstream::Context,
    settings: ListenerSettings,
}

impl SubmissionListener {
    pub fn new(client: async_nats::Client, settings: ListenerSettings) -> Self {
        Self {
            jetstream: jetstream::new(client),
            settings,
        }
    }

    /// Subscribes once and processes deliveries until the message stream ends.
    pub async fn run(&self, handler: Arc<dyn SubmissionHandler>) -> Result<(), ListenerError> {
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: self.settings.stream.clone(),
                subjects: vec![SUBMITTED_SUBJECT.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| ListenerError::Stream {
                stream: self.settings.stream.clone(),
                message: e.to_string(),
            })?;

        let consumer_name = self.settings.queue_group.clone();
        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    filter_subject: SUBMITTED_SUBJECT.to_string(),
                    deliver_policy: DeliverPolicy::All,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.settings.ack_wait,
                    max_deliver: self.settings.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ListenerError::Consumer {
                consumer: consumer_name.clone(),
                message: e.to_string(),
            })?;

        info!(
            "Listening on {} (stream {}, consumer {}, concurrency {})",
            SUBMITTED_SUBJECT, self.settings.stream, consumer_name, self.settings.max_concurrent
        );

        let messages = consumer
            .messages()
            .await
            .map_err(|e| ListenerError::Messages(e.to_string()))?;

        messages
            .for_each_concurrent(self.settings.max_concurrent.max(1), |delivery| {
                let handler = handler.clone();
                async move {
                    let message = match delivery {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Error receiving submission: {e}");
                            return;
                        }
                    };
                    let disposition = dispatch(handler.as_ref(), &message.payload).await;
                    if let Err(e) = message.ack_with(disposition.ack_kind()).await {
                        warn!("Failed to {disposition:?} submission: {e}");
                    }
                }
            })
            .await;

        warn!("Submission message stream ended");
        Ok(())
    }
}
