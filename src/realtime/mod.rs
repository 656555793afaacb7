pub mod backoff;
pub mod connection;
pub mod room;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use connection::{Connection, ConnectionManager, ConnectionSignal, ConnectionState};
pub use room::{RoomEvent, RoomState, RoomSubscription};
pub use transport::{Link, Transport, WsTransport};
