pub mod analysis;
pub mod context;
pub mod docker;
pub mod fetch;
pub mod jobmanager;
pub mod lms;
pub mod lockmanager;
pub mod pool;
pub mod scoring;
pub mod similarity;
pub mod store;


pub use context::Runtime;
pub use jobmanager::{Job, JobHandle, JobOptions, JobOutput};
pub use lockmanager::{LockError, LockManager};
