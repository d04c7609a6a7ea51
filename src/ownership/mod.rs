//! Entity-ownership arbitration on eventually-consistent replicated state. Nothing here goes
//! through the raft log.
mod crdt;
mod map;

pub use crdt::LamportClock;
pub use crdt::LwwRegister;
pub use crdt::OrSet;
pub use map::Entity;
pub use map::EntityOwnershipMap;
pub use map::OwnerSupervisor;
pub use map::OwnershipChange;
