//! Realtime transport bindings: a Phoenix v2 websocket client and an
//! in-process mock.

pub mod channel;
pub mod frame;
pub mod mock;
pub mod socket;

pub use channel::PhoenixChannel;
pub use frame::Frame;
pub use mock::{MockTransport, TransportOp};
pub use socket::{PhoenixSocket, SocketConfig};
