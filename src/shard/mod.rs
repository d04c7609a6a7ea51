//! The replicated data tree: its in-memory model, the commands that change it, and the state
//! machine that applies them on every member.
mod client;
mod payload;
mod state;
mod tree;

pub use client::ShardClient;
pub use client::ShardClientError;
pub use payload::Modification;
pub use payload::ModificationBatch;
pub use payload::MODIFICATION_BATCH_TYPE;
pub use state::Shard;
pub use state::ShardReader;
pub use tree::DataTree;
pub use tree::DataTreeSnapshot;
pub use tree::TreeError;
