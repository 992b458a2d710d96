//! Admission counting and state management.

pub mod clock;
mod key;
mod limiter;
mod memory;
mod policy;
mod redis_store;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::WindowKey;
pub use limiter::{AdmissionEngine, Verdict, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
pub use memory::MemoryCounterStore;
pub use policy::{Policy, Quota, MAX_WINDOW};
pub use redis_store::RedisCounterStore;
pub use store::{CounterStore, StoreError};
