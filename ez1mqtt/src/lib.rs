// externally visible interfaces
pub mod config;
pub mod error;
pub mod reading;
pub mod scheduler;
pub mod sources;
pub mod sun_window;
pub mod targets;
