//! Output renderers: JSON, Markdown and CSV.

pub mod csv;
pub mod json;
pub mod markdown;
