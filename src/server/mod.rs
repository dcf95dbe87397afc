//! Reference record server used as the remote store by the sync client.

pub mod auth;
pub mod routes;
pub mod storage;

pub use auth::{ApiKeyEntry, ApiKeyStore, AuthMember};
pub use routes::{router, AppState};
pub use storage::{RecordStorage, RecordStorageError, StoredRecord};
