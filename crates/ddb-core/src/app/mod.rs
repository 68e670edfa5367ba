pub mod maintenance;
pub mod scheduler;
