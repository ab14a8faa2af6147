//! echo-client: a verifying client for the echo protocol
//!
//! Connects to an echo server, writes a payload and checks that exactly the
//! same bytes come back before reporting success.
//!
//! Layers, leaves first:
//! - `transport`: byte-stream transport contract and a TCP implementation
//! - `engine`: reassembly and verification of the echoed bytes
//! - `controller`: connection lifecycle and the echo transaction steps
//! - `session`: the task that serialises everything and the `EchoClient` handle
//!
//! Status changes and errors leave the core only through a `Reporter`.

pub mod config;
pub mod controller;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod session;
pub mod status;
pub mod transport;

pub use controller::EchoOutcome;
pub use endpoint::{Endpoint, DEFAULT_ECHO_PORT};
pub use error::{ClientError, ConnectError, EchoError, ProtocolError, TransportError};
pub use session::EchoClient;
pub use status::{Reporter, Status, StatusEvent, TracingReporter};
