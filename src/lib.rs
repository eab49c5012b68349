#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod intent;
pub mod mcp;
pub mod pipeline;
pub mod render;
pub mod sources;
pub mod transform;

mod utils;
