pub mod deps;
pub mod jobs;
pub mod kv;
pub mod rate_limit;

pub use deps::{ServerDeps, ADHOC_CAMPAIGN};
pub use kv::KvStore;
