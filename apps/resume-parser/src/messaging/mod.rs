//! NATS adapter: inbound submissions and outbound pipeline events.

pub mod listener;
pub mod publisher;

pub use listener::{ListenerSettings, SubmissionHandler, SubmissionListener};
pub use publisher::{publish_json, EventPublisher, NatsEventPublisher};
