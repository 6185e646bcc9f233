//! Domain types - configuration and indexes
//!
//! These types are shared by the synchronizer, the queue and the registry and
//! carry no behaviour tied to a particular source.

pub mod config;
pub mod index;
