pub mod artifacts;
pub mod database;
pub mod error;
pub mod memory;
pub mod memory_sessions;
pub mod row_helpers;
pub mod schema;
pub mod service;
pub mod session;
pub mod sqlite;

pub use artifacts::{ArtifactService, InMemoryArtifactService};
pub use database::Database;
pub use error::{ServiceError, StoreError};
pub use memory::{InMemoryMemoryService, MemoryEntry, MemoryService};
pub use memory_sessions::InMemorySessionService;
pub use service::SessionService;
pub use session::{Session, SessionKey};
pub use sqlite::SqliteSessionService;
