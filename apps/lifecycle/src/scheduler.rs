pub mod cron;
pub mod service;
pub mod types;


pub use service::{
    SchedulerConfig, TaskContext, TaskHandler, TaskScheduler, TaskSpec, handler_fn,
};
