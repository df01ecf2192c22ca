pub mod accounts;
pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod infection;
pub mod lifecycle;
pub mod locks;
pub mod manifest;
pub mod pipeline;
pub mod registry;
pub mod sources;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{PandemicError, Result};
