pub mod app;
pub mod broadcast;
pub mod clock_service;
pub mod clock_state;
pub mod config;
pub mod console;
pub mod error;
pub mod server;
pub mod time_source;
pub mod wall_clock;
