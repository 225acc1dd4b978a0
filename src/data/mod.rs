//! Reading buffers and project persistence.

pub mod reading_store;
pub mod storage;

pub use reading_store::ReadingStore;
pub use storage::{JsonProjectStore, ProjectStore};
