pub mod store;

pub use store::{MemoryClusterStore, fix_dim};
