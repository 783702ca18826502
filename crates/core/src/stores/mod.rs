pub mod memory;
pub mod rest;

pub use memory::MemoryStateStore;
pub use rest::{RestBlobStore, RestStateStore};
