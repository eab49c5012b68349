//! Internal helpers for cache paths.

pub(crate) mod download;
