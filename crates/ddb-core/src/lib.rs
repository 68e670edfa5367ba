pub mod access;
pub mod app;
pub mod clock;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod jobs;
pub mod ledger;
pub mod prune;
pub mod quiesce;
pub mod reader;

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod tests;

pub use engine::{Engine, EngineBuilder};
pub use error::{DdbError, Result};
