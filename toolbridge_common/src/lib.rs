//! Protocol-level building blocks shared by the toolbridge crates:
//! newline-delimited JSON framing and the JSON-RPC 2.0 message model.

pub mod frame;
pub mod message;

pub use frame::{FrameDecoder, FrameError, FrameStats};
pub use message::{MessageKind, RequestId, RpcError};
