pub mod auth;
pub mod handler;
pub mod server;
pub mod stdio;
pub mod types;

pub use auth::AuthConfig;
pub use handler::{McpHandler, ProxyStatus, ServerInfo};
pub use server::{create_router, start_server, AppState};
pub use stdio::serve_stdio;
