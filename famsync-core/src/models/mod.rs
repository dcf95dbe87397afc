//! Data model shared by the queue, the engine and the host application.

mod entity;
mod mutation;
mod resolution;
mod statistics;

pub use entity::{EntityType, Operation};
pub use mutation::{entity_id_from, Mutation, MutationStatus, Payload};
pub use resolution::{ConflictResolution, ConflictStrategy};
pub use statistics::{StatusCounts, SyncStatistics};
