pub mod config;
pub mod error;
pub mod model;
pub mod ports;
pub mod store;

pub use config::AgentMeshConfig;
pub use error::CoreError;
pub use ports::{LlmClient, Prompt, SearchHit, VectorSearch};
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};
