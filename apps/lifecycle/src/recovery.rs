pub mod service;
pub mod strategy;

#[cfg(test)]
mod tests;

pub use service::{RecoveryAction, RecoveryReport, TaskRecovery};
pub use strategy::default_strategies;
