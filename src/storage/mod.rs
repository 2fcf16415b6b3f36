pub mod file;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use traits::{load_as, save_as, StateStore};
