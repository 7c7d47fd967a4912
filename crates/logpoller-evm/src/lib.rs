//! logpoller-evm — Ethereum JSON-RPC client and builder for the log poller.
//!
//! - [`request`] — JSON-RPC 2.0 wire types
//! - [`transport`] — the `RpcTransport` seam and its `reqwest` HTTP transport
//! - [`client`] — `EvmChainClient`, a `ChainClient` over `eth_*` calls
//! - [`builder`] — `PollerBuilder`, fluent poller construction

pub mod builder;
pub mod client;
pub mod request;
pub mod transport;

pub use builder::PollerBuilder;
pub use client::{is_result_limit_error, EvmChainClient};
pub use transport::{HttpTransport, RpcTransport, TransportError};
