//! Inter-member RPC: protobuf-shaped messages, the transport seam, the inbound server, and an
//! in-process network.
mod convert;
mod local;
mod proto;
mod server;
mod transport;

pub(crate) use convert::{
    index_to_proto, log_entry_metadata_to_proto, log_entry_to_proto,
};
pub use local::LocalNetwork;
pub use proto::*;
pub use server::RpcServer;
pub use transport::PeerTransport;
pub use transport::TransportError;
