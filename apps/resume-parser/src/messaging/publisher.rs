use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out after {0:?} publishing to {1}")]
    Timeout(Duration, String),

    #[error("NATS publish to {subject} failed: {message}")]
    Nats { subject: String, message: String },
}

/// Outbound side of the broker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), PublishError>;
}

/// Serializes `event` as JSON and publishes it on `subject`.
pub async fn publish_json<T>(
    publisher: &dyn EventPublisher,
    subject: &str,
    event: &T,
) -> Result<(), PublishError>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(event)?;
    publisher.publish(subject, Bytes::from(payload)).await
}

/// Core NATS publisher. Subjects are captured by whatever JetStream streams
/// cover them.
#[derive(Clone)]
pub struct NatsEventPublisher {
    client: async_nats::Client,
    timeout: Duration,
}

impl NatsEventPublisher {
    pub fn new(client: async_nats::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), PublishError> {
        let size = payload.len();
        match timeout(self.timeout, self.client.publish(subject.to_string(), payload)).await {
            Ok(Ok(())) => {
                debug!("Published {size} bytes to NATS subject: {subject}");
                Ok(())
            }
            Ok(Err(e)) => Err(PublishError::Nats {
                subject: subject.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(PublishError::Timeout(self.timeout, subject.to_string())),
        }
    }
}

#[cfg(test)]
pub mod recording {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use serde_json::Value;

    use super::*;

    /// Captures published events; subjects can be made to fail.
    #[derive(Debug, Default)]
    pub struct RecordingPublisher {
        events: Mutex<Vec<(String, Value)>>,
        failing: Mutex<HashSet<String>>,
    }

    impl RecordingPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_subject(&self, subject: &str) {
            self.failing.lock().unwrap().insert(subject.to_string());
        }

        pub fn events(&self) -> Vec<(String, Value)> {
            self.events.lock().unwrap().clone()
        }

        pub fn on(&self, subject: &str) -> Vec<Value> {
            self.events()
                .into_iter()
                .filter(|(s, _)| s == subject)
                .map(|(_, v)| v)
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), PublishError> {
            if self.failing.lock().unwrap().contains(subject) {
                return Err(PublishError::Nats {
                    subject: subject.to_string(),
                    message: "connection closed".to_string(),
                });
            }
            let value: Value = serde_json::from_slice(&payload)?;
            self.events.lock().unwrap().push((subject.to_string(), value));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::recording::RecordingPublisher;
    use super::*;

    #[tokio::test]
    async fn test_publish_json() {
        let publisher = RecordingPublisher::new();
        publish_json(&publisher, "a.b", &json!({"jobId": "job-1"}))
            .await
            .unwrap();
        assert_eq!(publisher.on("a.b"), vec![json!({"jobId": "job-1"})]);
    }

    #[tokio::test]
    async fn test_failing_subject() {
        let publisher = RecordingPublisher::new();
        publisher.fail_subject("a.b");
        let err = publish_json(&publisher, "a.b", &json!({})).await.unwrap_err();
        assert!(matches!(err, PublishError::Nats { .. }));
        assert!(publisher.events().is_empty());
    }
}
