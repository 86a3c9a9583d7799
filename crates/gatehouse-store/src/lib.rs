pub mod memory;
pub mod sqlite;

pub use memory::MemoryInstanceStore;
pub use sqlite::SqliteInstanceStore;
