pub mod connector;
pub mod http_client;
pub mod mcp;
pub mod sse_client;
pub mod stdio_client;
pub mod telegram;

pub use connector::{build_drivers, McpConnector};
pub use http_client::HttpConnection;
pub use sse_client::SseConnection;
pub use stdio_client::StdioConnection;
pub use telegram::TelegramDriver;
