pub mod record;
pub mod storage;

pub use record::LifecycleRecord;
pub use storage::{JsonFileStore, LifecycleStore, RecordListing};
