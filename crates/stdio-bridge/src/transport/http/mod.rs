//! HTTP transport: `/rpc`, `/mcp` and `/health` over axum.

mod routes;
mod server;

pub use routes::routes;
pub use server::{ServerConfig, serve};
