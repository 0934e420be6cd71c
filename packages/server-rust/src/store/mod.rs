//! Per-bucket value storage.

mod value_store;

pub use value_store::{MapList, ValueStore};
