/// Scanning module
///
/// This module handles:
/// - Walking the game directory for launchable files (indexer.rs)
/// - Reconciling each walk against the catalog and publishing changes (reconciler.rs)

pub mod indexer;
pub mod reconciler;
