//! Utility modules

pub mod logger;
pub mod poll;
pub mod timer;

pub use poll::Poller;
