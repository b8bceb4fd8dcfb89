//! # Toolbridge HTTP
//!
//! An HTTP front door for tool providers that speak newline-delimited
//! JSON-RPC over stdin/stdout.
//!
//! ## Architecture
//!
//! *   **Supervisor**: one child process per provider, spawned lazily, with
//!     stdout decoded into frames and stderr routed to the log.
//! *   **Session**: the `initialize` handshake and id-correlated calls with
//!     per-call timeouts. A dead child is replaced on the next request.
//! *   **Registry / Router**: static set of named providers; requests are
//!     routed by `provider.tool` namespace, `provider` hint or default, and
//!     `tools/list` can fan out to every provider.
//! *   **Bridge**: axum routes `/health`, `/tools`, `/tools/{tool_name}` and
//!     the `/mcp` passthrough.
//!
//! ## Example
//!
//! ```rust,no_run
//! use toolbridge_http::{BridgeConfig, ProviderSpec, start_bridge};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig {
//!         bind_addr: "127.0.0.1:3000".parse()?,
//!         providers: vec![
//!             ProviderSpec::new("xero", "xero-mcp-server").with_env("XERO_CLIENT_ID", "..."),
//!             ProviderSpec::new("supabase", "npx").with_args(["-y", "@supabase/mcp-server-supabase"]),
//!         ],
//!         ..BridgeConfig::default()
//!     };
//!
//!     start_bridge(config).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;

pub use bridge::{build_app, serve, shutdown_signal, start_bridge};
pub use config::{BridgeConfig, ProviderSpec};
pub use error::{BridgeError, Result};
pub use registry::ProviderRegistry;
pub use router::{ProviderRouter, ProviderSelector};
pub use session::{RpcSession, SessionState, SessionStatus};
pub use supervisor::{ChildProcess, ExitReason, ProcessSupervisor};
