/// Thumbnail module
///
/// This module handles:
/// - Finding and decoding preview images for game files
/// - Shrinking them to tile size
/// - Caching previews on disk keyed by stable id and fingerprint
/// - Evicting unreferenced previews when the cache grows too large

pub mod cache;
pub mod thumbnail;
