//! Offline cache manager for a small static site.
//!
//! Requests run through [`worker::OfflineCacheManager`], which serves cached
//! copies first, refreshes them from the network in the background, and
//! seeds a precache manifest when the network is down.

pub mod cache;
pub mod config;
pub mod net;
pub mod worker;
