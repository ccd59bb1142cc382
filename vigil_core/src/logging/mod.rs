//! Structured, redacted logging

pub mod entry;
pub mod pipeline;

pub use entry::{describe_error, LogCategory, LogEntry, LogLevel, NoSession, SessionResolver, StaticSession};
pub use pipeline::{LogPipeline, MIRROR_TARGET};
