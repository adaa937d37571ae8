/// State management module
///
/// This module handles the catalog itself:
/// - Shared data structures (data.rs)
/// - The persisted catalog and incremental merges (store.rs)

pub mod data;
pub mod store;
