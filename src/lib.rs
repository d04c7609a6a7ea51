mod actor;
mod admission;
mod api;
mod codec;
mod commitlog;
mod io;
mod ownership;
mod replica;
mod rpc;
mod shard;

pub use admission::AveragingProgressTracker;
pub use api::try_create_raft_client;
pub use api::AppendEntryInput;
pub use api::AppendEntryOutput;
pub use api::AppendError;
pub use api::ApplyError;
pub use api::ClientRequestId;
pub use api::ClusterState;
pub use api::CommitApplier;
pub use api::LeadershipTransferError;
pub use api::MembershipChangeError;
pub use api::RaftClient;
pub use api::RaftClientConfig;
pub use api::RaftClientCreationError;
pub use api::RaftCommitStream;
pub use api::RaftCommittedEntry;
pub use api::RaftEntryId;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftLeaderInfo;
pub use api::RaftMemberInfo;
pub use api::RaftOptions;
pub use api::RaftRole;
pub use api::RaftState;
pub use api::RecoveryCohort;
pub use api::ReplicaExited;
pub use api::ReplicatedLog;
pub use api::SnapshotCohort;
pub use api::SnapshotError;
pub use api::SnapshotInfo;
pub use api::StateMachine;
pub use api::StateSnapshot;
pub use api::StorageConfig;
pub use codec::AllowListResolver;
pub use codec::CodecError;
pub use codec::DecodeFn;
pub use codec::DecodedObject;
pub use codec::NodePath;
pub use codec::NodeStreamReader;
pub use codec::NodeStreamWriter;
pub use codec::NormalizedNode;
pub use codec::PathArgument;
pub use codec::PathCodec;
pub use codec::PrimitiveType;
pub use codec::QName;
pub use codec::QNameCache;
pub use codec::ResolveError;
pub use codec::Resolved;
pub use codec::RestrictedObjectReader;
pub use codec::RestrictedObjectWriter;
pub use codec::RestrictedTypeResolver;
pub use codec::TypeNotFound;
pub use codec::TypeResolver;
pub use codec::Value;
pub use codec::STREAM_VERSION;
pub use commitlog::JournalError;
pub use io::new_compress_writer;
pub use io::new_decompress_reader;
pub use io::ByteSource;
pub use io::ChunkedByteArray;
pub use io::ChunkedOutputStream;
pub use io::FileBackedOutputStream;
pub use io::Lz4BlockSize;
pub use io::Lz4Writer;
pub use io::SharedFileBackedOutputStream;
pub use io::SharedStreamRef;
pub use ownership::Entity;
pub use ownership::EntityOwnershipMap;
pub use ownership::LamportClock;
pub use ownership::LwwRegister;
pub use ownership::OrSet;
pub use ownership::OwnerSupervisor;
pub use ownership::OwnershipChange;
pub use rpc::LocalNetwork;
pub use rpc::PeerTransport;
pub use rpc::ProtoAppendEntriesReq;
pub use rpc::ProtoAppendEntriesResult;
pub use rpc::ProtoInstallSnapshotReq;
pub use rpc::ProtoInstallSnapshotResult;
pub use rpc::ProtoRequestVoteReq;
pub use rpc::ProtoRequestVoteResult;
pub use rpc::RpcServer;
pub use rpc::TransportError;
pub use shard::DataTree;
pub use shard::DataTreeSnapshot;
pub use shard::Modification;
pub use shard::ModificationBatch;
pub use shard::Shard;
pub use shard::ShardClient;
pub use shard::ShardClientError;
pub use shard::ShardReader;
pub use shard::TreeError;
pub use shard::MODIFICATION_BATCH_TYPE;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
