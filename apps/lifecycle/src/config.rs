use std::env;

use chrono::{FixedOffset, Offset, Utc};
use thiserror::Error;

use crate::scheduler::SchedulerConfig;
use crate::scheduler::cron::{CronSchedule, parse_timezone};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecyclePolicyConfig {
    pub free_plan_id: String,
    /// Token quota granted when a user falls back to the free plan.
    pub free_plan_tokens: i64,
    pub free_plan_validity_days: i64,
    pub invitation_reward_days: i64,
    pub allocation_period_days: i64,
    pub sweep_batch_size: usize,
}

impl Default for LifecyclePolicyConfig {
    fn default() -> Self {
        Self {
            free_plan_id: "free".to_string(),
            free_plan_tokens: 1_000,
            free_plan_validity_days: 36_500,
            invitation_reward_days: 30,
            allocation_period_days: 30,
            sweep_batch_size: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobScheduleConfig {
    pub timezone: FixedOffset,
    pub expiration_cron: String,
    pub token_expiration_cron: String,
    pub monthly_allocation_cron: String,
}

impl Default for JobScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: Utc.fix(),
            expiration_cron: "0 0 * * *".to_string(),
            token_expiration_cron: "30 0 * * *".to_string(),
            monthly_allocation_cron: "0 1 * * *".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub delay_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_seconds: 5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub db_url: Option<String>,
    pub log_json: bool,
    pub policy: LifecyclePolicyConfig,
    pub schedules: JobScheduleConfig,
    pub recovery: RecoveryConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "lifecycle".to_string(),
            db_url: None,
            log_json: false,
            policy: LifecyclePolicyConfig::default(),
            schedules: JobScheduleConfig::default(),
            recovery: RecoveryConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid LIFECYCLE_TIMEZONE: {0}")]
    InvalidTimezone(String),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("invalid LIFECYCLE_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
    #[error("invalid lifecycle policy config: {0}")]
    InvalidPolicyConfig(String),
    #[error("invalid recovery config: {0}")]
    InvalidRecoveryConfig(String),
    #[error("invalid scheduler config: {0}")]
    InvalidSchedulerConfig(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let service_name = lookup("LIFECYCLE_SERVICE_NAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.service_name);
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let log_json = parse_with_lookup(&lookup, "LIFECYCLE_LOG_FORMAT", false, |raw| {
            match raw.trim().to_ascii_lowercase().as_str() {
                "json" => Ok(true),
                "text" | "pretty" | "" => Ok(false),
                other => Err(ConfigError::InvalidLogFormat(other.to_string())),
            }
        })?;

        Ok(Self {
            service_name,
            db_url,
            log_json,
            policy: parse_policy_from_lookup(&lookup)?,
            schedules: parse_schedules_from_lookup(&lookup)?,
            recovery: parse_recovery_from_lookup(&lookup)?,
            scheduler: parse_scheduler_from_lookup(&lookup)?,
        })
    }
}

fn parse_policy_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<LifecyclePolicyConfig, ConfigError> {
    let defaults = LifecyclePolicyConfig::default();
    let free_plan_id = lookup("LIFECYCLE_FREE_PLAN_ID")
        .map(|value| value.trim().to_string())
        .unwrap_or(defaults.free_plan_id);
    if free_plan_id.is_empty() {
        return Err(ConfigError::InvalidPolicyConfig(
            "LIFECYCLE_FREE_PLAN_ID: must not be empty".to_string(),
        ));
    }

    Ok(LifecyclePolicyConfig {
        free_plan_id,
        free_plan_tokens: parse_i64_lookup(
            lookup,
            "LIFECYCLE_FREE_PLAN_TOKENS",
            defaults.free_plan_tokens,
            0,
            i64::from(u32::MAX),
        )?,
        free_plan_validity_days: parse_i64_lookup(
            lookup,
            "LIFECYCLE_FREE_PLAN_VALIDITY_DAYS",
            defaults.free_plan_validity_days,
            1,
            36_500,
        )?,
        invitation_reward_days: parse_i64_lookup(
            lookup,
            "LIFECYCLE_INVITATION_REWARD_DAYS",
            defaults.invitation_reward_days,
            1,
            3_650,
        )?,
        allocation_period_days: parse_i64_lookup(
            lookup,
            "LIFECYCLE_ALLOCATION_PERIOD_DAYS",
            defaults.allocation_period_days,
            1,
            366,
        )?,
        sweep_batch_size: parse_with_lookup(
            lookup,
            "LIFECYCLE_SWEEP_BATCH_SIZE",
            defaults.sweep_batch_size,
            |raw| {
                raw.trim()
                    .parse::<usize>()
                    .map_err(|error| {
                        ConfigError::InvalidPolicyConfig(format!(
                            "LIFECYCLE_SWEEP_BATCH_SIZE: {error}"
                        ))
                    })
                    .map(|value| value.clamp(1, 10_000))
            },
        )?,
    })
}

fn parse_schedules_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<JobScheduleConfig, ConfigError> {
    let defaults = JobScheduleConfig::default();
    let timezone = parse_with_lookup(lookup, "LIFECYCLE_TIMEZONE", defaults.timezone, |raw| {
        parse_timezone(&raw).map_err(ConfigError::InvalidTimezone)
    })?;

    Ok(JobScheduleConfig {
        timezone,
        expiration_cron: parse_cron_lookup(
            lookup,
            "LIFECYCLE_EXPIRATION_CRON",
            defaults.expiration_cron,
        )?,
        token_expiration_cron: parse_cron_lookup(
            lookup,
            "LIFECYCLE_TOKEN_EXPIRATION_CRON",
            defaults.token_expiration_cron,
        )?,
        monthly_allocation_cron: parse_cron_lookup(
            lookup,
            "LIFECYCLE_MONTHLY_ALLOCATION_CRON",
            defaults.monthly_allocation_cron,
        )?,
    })
}

fn parse_recovery_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<RecoveryConfig, ConfigError> {
    let defaults = RecoveryConfig::default();
    let enabled = parse_with_lookup(lookup, "LIFECYCLE_RECOVERY_ENABLED", defaults.enabled, |raw| {
        parse_bool(&raw).ok_or_else(|| {
            ConfigError::InvalidRecoveryConfig(format!("LIFECYCLE_RECOVERY_ENABLED: {raw}"))
        })
    })?;
    let delay_seconds = parse_with_lookup(
        lookup,
        "LIFECYCLE_RECOVERY_DELAY_SECONDS",
        defaults.delay_seconds,
        |raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|error| {
                    ConfigError::InvalidRecoveryConfig(format!(
                        "LIFECYCLE_RECOVERY_DELAY_SECONDS: {error}"
                    ))
                })
                .map(|value| value.min(3_600))
        },
    )?;
    Ok(RecoveryConfig {
        enabled,
        delay_seconds,
    })
}

fn parse_scheduler_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<SchedulerConfig, ConfigError> {
    let defaults = SchedulerConfig::default();
    let instance_id = lookup("LIFECYCLE_INSTANCE_ID")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or(defaults.instance_id);
    let lease_enabled = parse_with_lookup(
        lookup,
        "LIFECYCLE_TASK_LEASE_ENABLED",
        defaults.lease_enabled,
        |raw| {
            parse_bool(&raw).ok_or_else(|| {
                ConfigError::InvalidSchedulerConfig(format!("LIFECYCLE_TASK_LEASE_ENABLED: {raw}"))
            })
        },
    )?;
    let lease_ttl_seconds = parse_with_lookup(
        lookup,
        "LIFECYCLE_TASK_LEASE_TTL_SECONDS",
        defaults.lease_ttl_seconds,
        |raw| {
            raw.trim()
                .parse::<i64>()
                .map_err(|error| {
                    ConfigError::InvalidSchedulerConfig(format!(
                        "LIFECYCLE_TASK_LEASE_TTL_SECONDS: {error}"
                    ))
                })
                .map(|value| value.clamp(30, 86_400))
        },
    )?;
    let history_limit = parse_with_lookup(
        lookup,
        "LIFECYCLE_TASK_HISTORY_LIMIT",
        defaults.history_limit,
        |raw| {
            raw.trim()
                .parse::<usize>()
                .map_err(|error| {
                    ConfigError::InvalidSchedulerConfig(format!(
                        "LIFECYCLE_TASK_HISTORY_LIMIT: {error}"
                    ))
                })
                .map(|value| value.clamp(1, 500))
        },
    )?;
    Ok(SchedulerConfig {
        instance_id,
        lease_enabled,
        lease_ttl_seconds,
        history_limit,
    })
}

fn parse_cron_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: String,
) -> Result<String, ConfigError> {
    let expression = lookup(key)
        .map(|value| value.trim().to_string())
        .unwrap_or(default);
    CronSchedule::parse(&expression)
        .map_err(|error| ConfigError::InvalidCron(format!("{key}: {error}")))?;
    Ok(expression)
}

fn parse_i64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
) -> Result<i64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<i64>()
            .map_err(|error| ConfigError::InvalidPolicyConfig(format!("{key}: {error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::{Result, anyhow};
    use chrono::FixedOffset;

    use super::{Config, ConfigError};

    fn config_from(values: &HashMap<&str, &str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() -> Result<()> {
        let config = config_from(&HashMap::new())?;
        assert_eq!(config.service_name, "lifecycle");
        assert!(config.db_url.is_none());
        assert!(!config.log_json);
        assert_eq!(config.policy.free_plan_id, "free");
        assert_eq!(config.policy.free_plan_tokens, 1_000);
        assert_eq!(config.policy.free_plan_validity_days, 36_500);
        assert_eq!(config.policy.invitation_reward_days, 30);
        assert_eq!(config.schedules.expiration_cron, "0 0 * * *");
        assert_eq!(config.schedules.timezone.local_minus_utc(), 0);
        assert!(config.recovery.enabled);
        assert_eq!(config.recovery.delay_seconds, 5);
        assert!(!config.scheduler.lease_enabled);
        assert_eq!(config.scheduler.lease_ttl_seconds, 900);
        assert_eq!(config.scheduler.history_limit, 20);
        Ok(())
    }

    #[test]
    fn env_overrides_are_parsed_and_clamped() -> Result<()> {
        let values = HashMap::from([
            ("DATABASE_URL", " postgres://lifecycle@localhost/lifecycle "),
            ("LIFECYCLE_LOG_FORMAT", "JSON"),
            ("LIFECYCLE_INSTANCE_ID", "worker-2"),
            ("LIFECYCLE_TIMEZONE", "+08:00"),
            ("LIFECYCLE_EXPIRATION_CRON", "0 2 * * *"),
            ("LIFECYCLE_FREE_PLAN_ID", "starter"),
            ("LIFECYCLE_FREE_PLAN_TOKENS", "250"),
            ("LIFECYCLE_INVITATION_REWARD_DAYS", "14"),
            ("LIFECYCLE_ALLOCATION_PERIOD_DAYS", "9999"),
            ("LIFECYCLE_RECOVERY_ENABLED", "off"),
            ("LIFECYCLE_TASK_LEASE_ENABLED", "yes"),
            ("LIFECYCLE_TASK_LEASE_TTL_SECONDS", "5"),
        ]);
        let config = config_from(&values)?;
        assert_eq!(
            config.db_url.as_deref(),
            Some("postgres://lifecycle@localhost/lifecycle")
        );
        assert!(config.log_json);
        assert_eq!(config.scheduler.instance_id, "worker-2");
        assert_eq!(
            Some(config.schedules.timezone),
            FixedOffset::east_opt(8 * 3600)
        );
        assert_eq!(config.schedules.expiration_cron, "0 2 * * *");
        assert_eq!(config.policy.free_plan_id, "starter");
        assert_eq!(config.policy.free_plan_tokens, 250);
        assert_eq!(config.policy.invitation_reward_days, 14);
        assert_eq!(config.policy.allocation_period_days, 366);
        assert!(!config.recovery.enabled);
        assert!(config.scheduler.lease_enabled);
        assert_eq!(config.scheduler.lease_ttl_seconds, 30);
        Ok(())
    }

    #[test]
    fn invalid_values_name_the_offending_key() -> Result<()> {
        let values = HashMap::from([("LIFECYCLE_TOKEN_EXPIRATION_CRON", "61 * * * *")]);
        match config_from(&values) {
            Err(ConfigError::InvalidCron(message)) => {
                assert!(message.contains("LIFECYCLE_TOKEN_EXPIRATION_CRON"));
            }
            other => return Err(anyhow!("unexpected result: {other:?}")),
        }

        let values = HashMap::from([("LIFECYCLE_INVITATION_REWARD_DAYS", "thirty")]);
        match config_from(&values) {
            Err(ConfigError::InvalidPolicyConfig(message)) => {
                assert!(message.contains("LIFECYCLE_INVITATION_REWARD_DAYS"));
            }
            other => return Err(anyhow!("unexpected result: {other:?}")),
        }

        let values = HashMap::from([("LIFECYCLE_TIMEZONE", "Mars/Olympus")]);
        assert!(matches!(
            config_from(&values),
            Err(ConfigError::InvalidTimezone(_))
        ));

        let values = HashMap::from([("LIFECYCLE_RECOVERY_ENABLED", "maybe")]);
        assert!(matches!(
            config_from(&values),
            Err(ConfigError::InvalidRecoveryConfig(_))
        ));
        Ok(())
    }
}
