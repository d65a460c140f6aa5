#![allow(clippy::result_large_err)]
// Library entrypoint for the server binary and integration tests.
pub mod api;
pub mod core;
pub mod services;
pub mod storage;

pub use crate::api::build_router;
pub use crate::core::{auth, config, shutdown, state, time_utils};
pub use crate::services::{
    agents, executor, learning, llm, maintenance, subscription, task_queue, user_store,
};
