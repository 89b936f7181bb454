//! LAN peer-to-peer networking core: UDP broadcast discovery with liveness
//! tracking, a framed TCP connection lifecycle manager, and an event bus
//! that couples the two behind a single node facade.

pub mod config_file;
pub mod discovery;
pub mod error;
pub mod event_bus;
pub mod logging;
pub mod message;
pub mod node;
pub mod peer_channel;
pub mod transport;

pub use discovery::{DiscoveredNode, DiscoveryIntervals, DiscoveryService};
pub use error::{NetError, Result};
pub use event_bus::{EventBus, Handler, MessageReceived, NodeDiscovered, NodeLost};
pub use message::Message;
pub use node::{Node, NodeConfig, NodeMetadata, NodeState};
pub use peer_channel::{ChannelEvents, ChannelState, PeerChannel};
pub use transport::TransportService;
