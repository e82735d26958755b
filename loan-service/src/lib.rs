pub mod config;
pub mod models;
pub mod service;

pub use config::ServiceConfig;
pub use models::{TurnRequest, TurnResponse};
pub use service::{AppState, create_app};
