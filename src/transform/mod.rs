//! Transforms from per-source native records into the common result schema.

pub mod harmonize;
pub mod phase;
pub mod schema;
