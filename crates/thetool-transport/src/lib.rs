//! Inspector wire layer.
//!
//! Provides:
//! - WebSocket frame codec and client transport
//! - Worker relay transport tunnelled through a parent connection
//! - JSON-RPC connection with typed inspector events
//! - In-memory transports for tests (feature: test-support)

pub mod connection;
pub mod endpoint;
pub mod frame;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod websocket;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use connection::{Connection, ConnectionError, Subscription};
pub use endpoint::{Endpoint, EndpointError};
pub use frame::{FixedMask, Frame, FrameCodec, FrameError, MaskSource};
pub use protocol::{Event, EventKind, ProtocolError, RemoteObject};
pub use relay::RelayTransport;
pub use transport::{Transport, TransportError};
pub use websocket::WebSocketTransport;
