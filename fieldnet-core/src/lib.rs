//! FieldNet protocol reference implementation.
//! Transport-free: the server and client crates own the sockets; everything
//! here works on byte buffers, decoded packets and the `PacketSink` seam.

pub mod body;
pub mod dispatch;
pub mod handler;
pub mod header;
pub mod node;
pub mod packet;
pub mod registry;

pub use body::{Body, BodyError, SubscriptionEntry, STATUS_FAILED, STATUS_OK};
pub use dispatch::Dispatcher;
pub use handler::{default_dispatcher, ServerContext};
pub use header::{Header, HeaderError, MsgType, HEADER_LEN, MAGIC, PROTOCOL_VERSION};
pub use node::{NodeDescriptor, NodeId, NodeIdAllocator, NodeType, BROADCAST, SERVER};
pub use packet::{Packet, PacketError};
pub use registry::{Connection, PacketSink, Registry, SendError, SinkClosed};
