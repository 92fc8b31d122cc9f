// Background pipeline: resume ingestion batches and bulk ranking runs.
// External services are reached only through the collaborator traits, so every
// stage here runs against in-memory fakes in tests.

pub mod accumulator;
pub mod ranking;
pub mod resume_processor;
pub mod workers;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
