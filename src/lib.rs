#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod node;
pub mod registry;
pub mod store;
pub mod tracker;
pub mod tree;

pub use config::{FanoutConfig, KeyOrder, LexicographicOrder, PlainValue, ValueCodec};
pub use error::{StoreError, TreeError};
pub use node::Key;
pub use registry::Registry;
pub use store::{MemStore, NodeStore};
pub use tree::Tree;
