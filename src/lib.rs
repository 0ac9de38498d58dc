pub mod analysis;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod recorder;
pub mod stream_manager;
pub mod worker;

pub use error::Error;
pub use stream_manager::{StreamComponents, StreamManager, StreamStatus};
