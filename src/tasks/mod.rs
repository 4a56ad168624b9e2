//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a cache is alive.
//!
//! # Tasks
//! - Reaper: removes expired entries and fires expiry callbacks at a fixed interval

mod reaper;

pub use reaper::{spawn_reaper, Reaper, Sweep};
