pub mod encoder;
pub mod live_packager;
pub mod playlist;
pub mod record;
pub mod scheduler;
pub mod segment;
pub mod storage_cleanup;

pub use encoder::{EncoderFactory, FfmpegEncoderFactory, FrameEncoder};
pub use live_packager::{FfmpegLiveLauncher, LiveEncoderLauncher, LivePackager, LiveStatus};
pub use record::{SegmentWriter, SegmentWriterConfig, WriteOutcome};
pub use scheduler::{SchedulerSettings, SegmentScheduler, TickOutcome};
pub use storage_cleanup::StorageCleanupService;
