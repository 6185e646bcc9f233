//! CLI command implementations

mod app;
mod config;
mod index;
mod list;
mod search;
mod watch;

pub use config::{cmd_config_init, cmd_config_show};
pub use index::{cmd_index, cmd_rebuild, cmd_remove, cmd_update};
pub use list::{cmd_errors, cmd_list};
pub use search::cmd_search;
pub use watch::cmd_watch;
