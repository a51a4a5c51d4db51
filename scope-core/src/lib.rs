pub mod accumulator;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod http_client;
pub mod model;
pub mod models;
pub mod relay;
pub mod server;
pub mod session;
pub mod store;
pub mod stream;
pub mod telemetry;

pub use error::{CoreResult, ScopeError};
pub use server::{AppState, create_router, run_server};
