pub mod config;
pub mod database;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

#[cfg(test)]
mod test;

pub use services::orchestrator::{EngineConfig, Gateways, RagOrchestrator};
pub use utils::error::{ChatError, ErrorKind};
