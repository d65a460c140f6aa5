pub mod agents;
pub mod executor;
pub mod learning;
pub mod llm;
pub mod maintenance;
pub mod subscription;
pub mod task_queue;
pub mod user_store;
