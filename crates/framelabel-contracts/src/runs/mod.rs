pub mod cache;
pub mod snapshots;
pub mod summary;
