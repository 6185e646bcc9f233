mod domain;
pub use domain::{config, index};

pub mod dirs;
pub mod parse;
pub mod queue;
pub mod registry;
pub mod reporter;
pub mod store;
pub mod sync;
pub mod tree;
pub mod watcher;
