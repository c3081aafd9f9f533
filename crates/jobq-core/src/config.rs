// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::expr::{self, Expr};
use crate::rounding::RoundingRule;

const ROUND_ATTR_PREFIX: &str = "JOBQ_ROUND_ATTR_";

/// A check every new job must pass at commit.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequirement {
    /// Name reported when the check fails.
    pub name: String,
    /// Must evaluate to true against the new job.
    pub expr: Expr,
}

/// An attribute rewrite applied to every new job at commit.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitTransform {
    /// Attribute to set.
    pub attr: String,
    /// New value, evaluated against the job.
    pub expr: Expr,
    /// Only applied when this evaluates to true.
    pub condition: Option<Expr>,
}

/// Job queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory holding the log, its rotations and per-cluster side files
    pub spool_dir: PathBuf,
    /// Name used in `GlobalJobId`
    pub queue_name: String,
    /// Ceiling on the total number of jobs in the queue
    pub max_jobs_submitted: usize,
    /// Ceiling on jobs per owner
    pub max_jobs_per_owner: usize,
    /// Ceiling on jobs created by one transaction
    pub max_jobs_per_submission: usize,
    /// System-wide ceiling on materialized jobs per factory cluster
    pub max_materialize_per_cluster: usize,
    /// First cluster id handed out on a fresh queue
    pub cluster_initial_value: i32,
    /// Step between consecutive cluster ids
    pub cluster_increment: i32,
    /// Cluster ids wrap back to the initial value past this (0 = never)
    pub cluster_max_value: i32,
    /// Identities allowed to act on any job
    pub super_users: Vec<String>,
    /// Skip ownership checks entirely
    pub all_users_trusted: bool,
    /// Domain appended to owners in the derived `User` attribute
    pub uid_domain: String,
    /// Extra immutable attribute names
    pub immutable_attrs: Vec<String>,
    /// Extra protected attribute names
    pub protected_attrs: Vec<String>,
    /// Extra secure attribute names
    pub secure_attrs: Vec<String>,
    /// Rounding rules keyed by lowercase attribute name
    pub round_attrs: HashMap<String, RoundingRule>,
    /// Number of rotated logs to keep
    pub max_historical_logs: u32,
    /// How often the log is compacted
    pub log_truncate_interval: Duration,
    /// Upper bound on how long non-durable commits wait for a sync
    pub log_flush_delay: Duration,
    /// Open transactions idle longer than this are aborted
    pub transaction_idle_timeout: Duration,
    /// Connections idle longer than this are dropped
    pub connection_idle_timeout: Duration,
    /// Time one constraint scan request may spend before handing back a cursor
    pub scan_batch_time: Duration,
    /// Factory materialization tick
    pub materialize_interval: Duration,
    /// Delay before an empty factory cluster is re-checked for removal
    pub deferred_cleanup_delay: Duration,
    /// Hold back job removal until a finished-job hook has run
    pub job_finished_hook: bool,
    /// Checks applied to new jobs at commit
    pub submit_requirements: Vec<SubmitRequirement>,
    /// Rewrites applied to new jobs at commit, before requirements
    pub submit_transforms: Vec<SubmitTransform>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("spool"),
            queue_name: "jobq".to_string(),
            max_jobs_submitted: 10_000,
            max_jobs_per_owner: 100_000,
            max_jobs_per_submission: 20_000,
            max_materialize_per_cluster: 10_000,
            cluster_initial_value: 1,
            cluster_increment: 1,
            cluster_max_value: 0,
            super_users: vec!["root".to_string(), "condor".to_string()],
            all_users_trusted: false,
            uid_domain: "localdomain".to_string(),
            immutable_attrs: Vec::new(),
            protected_attrs: Vec::new(),
            secure_attrs: Vec::new(),
            round_attrs: HashMap::new(),
            max_historical_logs: 0,
            log_truncate_interval: Duration::from_secs(86_400),
            log_flush_delay: Duration::from_millis(5_000),
            transaction_idle_timeout: Duration::from_secs(300),
            connection_idle_timeout: Duration::from_secs(3_600),
            scan_batch_time: Duration::from_millis(20),
            materialize_interval: Duration::from_millis(500),
            deferred_cleanup_delay: Duration::from_millis(2_000),
            job_finished_hook: false,
            submit_requirements: Vec::new(),
            submit_transforms: Vec::new(),
        }
    }
}

fn env_or<T: FromStr>(var: &'static str, default: T, reason: &str) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(var.to_string(), reason.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_list(var: &'static str, default: &[&str]) -> Vec<String> {
    match std::env::var(var) {
        Ok(value) => split_list(&value),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ' ', '\t'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::Invalid(
                var.to_string(),
                "must be true or false".to_string(),
            )),
        },
        Err(_) => Ok(default),
    }
}

/// Parse `;`-separated `Name: expr` requirement entries.
pub fn parse_submit_requirements(text: &str) -> Result<Vec<SubmitRequirement>, String> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, body) = entry
                .split_once(':')
                .ok_or_else(|| format!("'{}' is not of the form Name: expr", entry))?;
            let name = name.trim();
            if !expr::is_valid_attr_name(name) {
                return Err(format!("bad requirement name '{}'", name));
            }
            let expr = expr::parse(body.trim()).map_err(|e| format!("{}: {}", name, e))?;
            Ok(SubmitRequirement {
                name: name.to_string(),
                expr,
            })
        })
        .collect()
}

/// Parse `;`-separated `Attr = expr [if expr]` transform entries.
pub fn parse_submit_transforms(text: &str) -> Result<Vec<SubmitTransform>, String> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (attr, body) = entry
                .split_once('=')
                .ok_or_else(|| format!("'{}' is not of the form Attr = expr", entry))?;
            let attr = attr.trim();
            if !expr::is_valid_attr_name(attr) {
                return Err(format!("bad transform attribute '{}'", attr));
            }
            let (value, condition) = match body.rsplit_once(" if ") {
                Some((value, cond)) => (
                    value,
                    Some(expr::parse(cond.trim()).map_err(|e| format!("{}: {}", attr, e))?),
                ),
                None => (body, None),
            };
            let expr = expr::parse(value.trim()).map_err(|e| format!("{}: {}", attr, e))?;
            Ok(SubmitTransform {
                attr: attr.to_string(),
                expr,
                condition,
            })
        })
        .collect()
}

impl QueueConfig {
    /// Defaults with the given spool directory.
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            ..Self::default()
        }
    }

    /// Path of the live log file.
    pub fn log_path(&self) -> PathBuf {
        self.spool_dir.join("job_queue.log")
    }

    /// Rounding rule for an attribute, if configured.
    pub fn round_rule(&self, name: &str) -> Option<&RoundingRule> {
        self.round_attrs.get(&name.to_ascii_lowercase())
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `JOBQ_SPOOL_DIR`: spool directory
    ///
    /// Optional (with defaults):
    /// - `JOBQ_QUEUE_NAME` (jobq)
    /// - `JOBQ_MAX_JOBS_SUBMITTED` (10000), `JOBQ_MAX_JOBS_PER_OWNER` (100000),
    ///   `JOBQ_MAX_JOBS_PER_SUBMISSION` (20000),
    ///   `JOBQ_MAX_MATERIALIZE_PER_CLUSTER` (10000)
    /// - `JOBQ_CLUSTER_INITIAL_VALUE` (1), `JOBQ_CLUSTER_INCREMENT` (1),
    ///   `JOBQ_CLUSTER_MAX_VALUE` (0)
    /// - `JOBQ_SUPER_USERS` (root,condor), `JOBQ_ALL_USERS_TRUSTED` (false),
    ///   `JOBQ_UID_DOMAIN` (localdomain)
    /// - `JOBQ_IMMUTABLE_ATTRS`, `JOBQ_PROTECTED_ATTRS`, `JOBQ_SECURE_ATTRS`
    /// - `JOBQ_ROUND_ATTR_<Name>`
    /// - `JOBQ_MAX_HISTORICAL_LOGS` (0), `JOBQ_LOG_TRUNCATE_INTERVAL_SECS` (86400),
    ///   `JOBQ_LOG_FLUSH_DELAY_MS` (5000), `JOBQ_TRANSACTION_IDLE_TIMEOUT_SECS` (300),
    ///   `JOBQ_CONNECTION_IDLE_TIMEOUT_SECS` (3600), `JOBQ_SCAN_BATCH_TIME_MS` (20),
    ///   `JOBQ_MATERIALIZE_INTERVAL_MS` (500), `JOBQ_DEFERRED_CLEANUP_DELAY_MS` (2000)
    /// - `JOBQ_JOB_FINISHED_HOOK` (false)
    /// - `JOBQ_SUBMIT_REQUIREMENTS`, `JOBQ_SUBMIT_TRANSFORMS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let spool_dir = std::env::var("JOBQ_SPOOL_DIR")
            .map_err(|_| ConfigError::Missing("JOBQ_SPOOL_DIR"))?;
        let d = Self::default();

        let positive = "must be a positive integer";
        let max_jobs_submitted = env_or("JOBQ_MAX_JOBS_SUBMITTED", d.max_jobs_submitted, positive)?;
        let max_jobs_per_owner = env_or("JOBQ_MAX_JOBS_PER_OWNER", d.max_jobs_per_owner, positive)?;
        let max_jobs_per_submission =
            env_or("JOBQ_MAX_JOBS_PER_SUBMISSION", d.max_jobs_per_submission, positive)?;
        let max_materialize_per_cluster = env_or(
            "JOBQ_MAX_MATERIALIZE_PER_CLUSTER",
            d.max_materialize_per_cluster,
            positive,
        )?;

        let cluster_initial_value: i32 =
            env_or("JOBQ_CLUSTER_INITIAL_VALUE", d.cluster_initial_value, "must be an integer")?;
        if cluster_initial_value < 1 {
            return Err(ConfigError::Invalid(
                "JOBQ_CLUSTER_INITIAL_VALUE".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let cluster_increment: i32 =
            env_or("JOBQ_CLUSTER_INCREMENT", d.cluster_increment, "must be an integer")?;
        if cluster_increment < 1 {
            return Err(ConfigError::Invalid(
                "JOBQ_CLUSTER_INCREMENT".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let cluster_max_value: i32 =
            env_or("JOBQ_CLUSTER_MAX_VALUE", d.cluster_max_value, "must be an integer")?;
        if cluster_max_value != 0 && cluster_max_value <= cluster_initial_value {
            return Err(ConfigError::Invalid(
                "JOBQ_CLUSTER_MAX_VALUE".to_string(),
                "must be 0 or greater than JOBQ_CLUSTER_INITIAL_VALUE".to_string(),
            ));
        }

        let mut round_attrs = HashMap::new();
        for (var, value) in std::env::vars() {
            let Some(attr) = var.strip_prefix(ROUND_ATTR_PREFIX) else {
                continue;
            };
            if !expr::is_valid_attr_name(attr) {
                return Err(ConfigError::Invalid(var.clone(), "bad attribute name".to_string()));
            }
            match RoundingRule::parse(&value) {
                Ok(Some(rule)) => {
                    round_attrs.insert(attr.to_ascii_lowercase(), rule);
                }
                Ok(None) => {}
                Err(reason) => return Err(ConfigError::Invalid(var.clone(), reason)),
            }
        }

        let submit_requirements = match std::env::var("JOBQ_SUBMIT_REQUIREMENTS") {
            Ok(text) => parse_submit_requirements(&text)
                .map_err(|e| ConfigError::Invalid("JOBQ_SUBMIT_REQUIREMENTS".to_string(), e))?,
            Err(_) => Vec::new(),
        };
        let submit_transforms = match std::env::var("JOBQ_SUBMIT_TRANSFORMS") {
            Ok(text) => parse_submit_transforms(&text)
                .map_err(|e| ConfigError::Invalid("JOBQ_SUBMIT_TRANSFORMS".to_string(), e))?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            spool_dir: PathBuf::from(spool_dir),
            queue_name: std::env::var("JOBQ_QUEUE_NAME").unwrap_or(d.queue_name),
            max_jobs_submitted,
            max_jobs_per_owner,
            max_jobs_per_submission,
            max_materialize_per_cluster,
            cluster_initial_value,
            cluster_increment,
            cluster_max_value,
            super_users: env_list("JOBQ_SUPER_USERS", &["root", "condor"]),
            all_users_trusted: env_bool("JOBQ_ALL_USERS_TRUSTED", d.all_users_trusted)?,
            uid_domain: std::env::var("JOBQ_UID_DOMAIN").unwrap_or(d.uid_domain),
            immutable_attrs: env_list("JOBQ_IMMUTABLE_ATTRS", &[]),
            protected_attrs: env_list("JOBQ_PROTECTED_ATTRS", &[]),
            secure_attrs: env_list("JOBQ_SECURE_ATTRS", &[]),
            round_attrs,
            max_historical_logs: env_or(
                "JOBQ_MAX_HISTORICAL_LOGS",
                d.max_historical_logs,
                "must be a non-negative integer",
            )?,
            log_truncate_interval: Duration::from_secs(env_or(
                "JOBQ_LOG_TRUNCATE_INTERVAL_SECS",
                86_400u64,
                positive,
            )?),
            log_flush_delay: Duration::from_millis(env_or(
                "JOBQ_LOG_FLUSH_DELAY_MS",
                5_000u64,
                positive,
            )?),
            transaction_idle_timeout: Duration::from_secs(env_or(
                "JOBQ_TRANSACTION_IDLE_TIMEOUT_SECS",
                300u64,
                positive,
            )?),
            connection_idle_timeout: Duration::from_secs(env_or(
                "JOBQ_CONNECTION_IDLE_TIMEOUT_SECS",
                3_600u64,
                positive,
            )?),
            scan_batch_time: Duration::from_millis(env_or(
                "JOBQ_SCAN_BATCH_TIME_MS",
                20u64,
                positive,
            )?),
            materialize_interval: Duration::from_millis(env_or(
                "JOBQ_MATERIALIZE_INTERVAL_MS",
                500u64,
                positive,
            )?),
            deferred_cleanup_delay: Duration::from_millis(env_or(
                "JOBQ_DEFERRED_CLEANUP_DELAY_MS",
                2_000u64,
                positive,
            )?),
            job_finished_hook: env_bool("JOBQ_JOB_FINISHED_HOOK", d.job_finished_hook)?,
            submit_requirements,
            submit_transforms,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}
