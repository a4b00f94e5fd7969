//! The discv5 protocol core: wire codec, handshake, session layer, message dispatch,
//! routing table, and the routing-table manager that ties them together.

pub mod codec;
pub mod dispatcher;
pub mod endpoint_tracker;
pub mod handshake;
pub mod manager;
pub mod messages;
pub mod routing_table;
pub mod session;
pub mod session_layer;

pub use dispatcher::{Dispatcher, OutboundSink};
pub use manager::RoutingTableManager;
pub use messages::Message;
pub use routing_table::RoutingTable;
pub use session_layer::SessionLayer;
