//! Rate decision logic and counter store bindings.

mod engine;
mod identity;
mod memory;
mod redis_store;
mod store;

pub use engine::{block_key, BlockFlagMode, Decision, DenyReason, RateDecisionEngine, WINDOW};
pub use identity::{ip_portion, IdentityKey, IdentityResolver, Namespace, Quota};
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use store::{CounterStore, StoreError, StoreResult};
