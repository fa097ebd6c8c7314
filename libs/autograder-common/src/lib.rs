pub mod analysis;
pub mod config;
pub mod error;
pub mod fileop;
pub mod filespec;
pub mod fsutil;
pub mod ids;
pub mod scheduled_time;
pub mod timestamp;
pub mod types;

pub use error::AutograderError;
pub use ids::{FullSubmissionId, PairwiseKey};
pub use timestamp::Timestamp;
