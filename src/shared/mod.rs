pub mod config;
pub mod logging;
pub mod store;

pub use config::{CoordinatorConfig, WorkerConfig};
pub use store::{MemoryStore, RedisStore, SessionStore};
