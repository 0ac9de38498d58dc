pub mod event_models;
pub mod job_models;

pub use event_models::RealtimeEvent;
pub use job_models::{
    AnalysisResultRecord, EnqueueOutcome, Job, JobStatus, JobSummary, NewJob,
};
