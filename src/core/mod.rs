pub mod auth;
pub mod config;
pub mod shutdown;
pub mod state;
pub mod time_utils;
