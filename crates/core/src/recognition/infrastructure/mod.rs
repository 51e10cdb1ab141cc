pub mod retry_scheduler;
pub mod worker_pool;
