pub mod classify;
pub mod config;
pub mod discovery;
pub mod error;
pub mod git;
pub mod link;
pub mod memory;
pub mod metrics;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod service;
pub mod validator;
pub mod watcher;

pub use config::Config;
pub use error::{Result, SyncError};
pub use validator::Validator;
pub use watcher::Watcher;
