//! The résumé parsing pipeline.
//!
//! `Received → Deduplicating → Downloading → ExtractingText → AIParsing →
//! Normalizing → Encrypting → Publishing → Done`, with any stage able to fall
//! to `Failed`. Every accepted submission ends in exactly one terminal event.

pub mod normalizer;
pub mod orchestrator;

pub use orchestrator::{Adapters, PipelineSettings, ResumePipeline};
