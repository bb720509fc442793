pub mod config;
pub mod db;
pub mod types;

#[macro_use]
extern crate tracing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
