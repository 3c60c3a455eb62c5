//! Persistence, retrieval, and table collaborators for Threadloom.

pub mod in_memory;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "sqlite")]
pub mod table;

pub use in_memory::InMemoryStore;
pub use vector::{VectorIndex, cosine_similarity, mmr_select};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
#[cfg(feature = "sqlite")]
pub use table::SqliteTableBackend;
