pub mod error;
pub mod memory_store;

pub use memory_store::MessageStore;
