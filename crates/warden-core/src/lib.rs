pub mod audit;
pub mod autoqueue;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod guard;
pub mod host;
pub mod io;
pub mod kit;
pub mod paths;
pub mod policy;
pub mod posture;
pub mod queue;
pub mod runner;
pub mod signals;
pub mod snapshot;
pub mod timeline;
pub mod trigger;
pub mod types;

pub use error::{Result, WardenError};
