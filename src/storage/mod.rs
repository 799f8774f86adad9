pub mod persistence;

pub use persistence::{EntityData, EntityStore, FileEntityStore, MemoryEntityStore};
