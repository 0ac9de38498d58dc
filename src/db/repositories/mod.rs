pub mod events;
pub mod jobs;
pub mod memory;

pub use events::{EventSink, PgEventsRepository};
pub use jobs::{JobStore, PgJobsRepository};
pub use memory::{MemoryEventSink, MemoryJobStore};
