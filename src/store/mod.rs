//! Guarded in-memory state and its durable snapshot.

pub mod guard;
pub mod records;
pub mod snapshot;

pub use guard::Guarded;
pub use records::ExchangeTree;
pub use snapshot::SnapshotStore;
