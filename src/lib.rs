pub mod broadcast;
pub mod cache;
pub mod cli;
pub mod codec;
pub mod config;
pub mod engine;
pub mod history;
pub mod intake;
pub mod search;
pub mod storage;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use engine::Engine;
