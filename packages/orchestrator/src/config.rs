use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;

use crate::dedup::DEFAULT_RETENTION_DAYS;
use crate::job::JobId;
use crate::layout::RunLayout;
use crate::pipeline::{ExternalCommand, RetryPolicy};
use crate::supervisor::{RunnerCommand, SuccessPolicy, SupervisorConfig};

/// Crawlers in their canonical run order.
pub const DEFAULT_JOBS: &[&str] = &[
    "01_BuySpeed_01",
    "01_BuySpeed_02",
    "02_NYC",
    "03_TXSMartBuy",
    "05_NYSCR",
    "06_MyFloridaMarketPlace",
    "07_StateOfGeorgia",
    "08_SFCityPartner",
    "09_CGIEVA",
    "10_BidBuysIllinoise",
    "11_PlanetBids_Hartford",
    "12_Bonfire_FairfaxCounty",
    "13_eMaryland_eMMA",
    "14_NorthCarolina_VendorPortal_eVP",
    "15_State_of_Conneticut_BidBoard",
    "16_CalProcure",
    "17_BidNet",
    "18_Ionwave",
    "19_Pennsylvania_eMarketplace",
    "20_County_of_San_Diego",
];

/// Orchestrator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub work_dir: PathBuf,
    pub run_date: String,
    pub jobs: Vec<JobId>,
    pub runner_program: String,
    pub runner_args: Vec<String>,
    pub lookback_days: u32,
    pub max_concurrency: usize,
    pub terminate_grace: Duration,
    pub success_policy: SuccessPolicy,
    pub enrich_command: Option<ExternalCommand>,
    pub upload_command: Option<ExternalCommand>,
    pub upload_retry: RetryPolicy,
    pub dedup_retention_days: i64,
    pub port: u16,
    pub auto_start: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from any variable lookup. Unset and empty values take defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let jobs: Vec<JobId> = match var("ORCHESTRATOR_JOBS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(JobId::from)
                .collect(),
            None => DEFAULT_JOBS.iter().map(|s| JobId::from(*s)).collect(),
        };
        if jobs.is_empty() {
            bail!("ORCHESTRATOR_JOBS must name at least one job");
        }

        let max_concurrency: usize = parse_or(&var, "MAX_CONCURRENCY", 4)?;
        if max_concurrency == 0 {
            bail!("MAX_CONCURRENCY must be at least 1");
        }

        let upload_attempts: u32 = parse_or(&var, "UPLOAD_MAX_RETRIES", 3)?;
        if upload_attempts == 0 {
            bail!("UPLOAD_MAX_RETRIES must be at least 1");
        }

        let success_policy = match var("SUCCESS_POLICY") {
            Some(s) => s
                .parse::<SuccessPolicy>()
                .map_err(anyhow::Error::msg)
                .context("SUCCESS_POLICY is invalid")?,
            None => SuccessPolicy::default(),
        };

        Ok(Self {
            work_dir: var("ORCHESTRATOR_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            run_date: var("ORCHESTRATOR_RUN_DATE").unwrap_or_else(RunLayout::default_run_date),
            jobs,
            runner_program: var("RUNNER_PROGRAM").unwrap_or_else(|| "python".to_string()),
            runner_args: var("RUNNER_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            lookback_days: parse_or(&var, "LOOKBACK_DAYS", 2)?,
            max_concurrency,
            terminate_grace: Duration::from_secs(parse_or(&var, "TERMINATE_GRACE_SECS", 5)?),
            success_policy,
            enrich_command: var("ENRICH_COMMAND").and_then(|s| ExternalCommand::parse(&s)),
            upload_command: var("UPLOAD_COMMAND").and_then(|s| ExternalCommand::parse(&s)),
            upload_retry: RetryPolicy {
                max_attempts: upload_attempts,
                delay: Duration::from_secs(parse_or(&var, "UPLOAD_RETRY_DELAY_SECS", 5)?),
            },
            dedup_retention_days: parse_or(&var, "DEDUP_RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?,
            port: parse_or(&var, "PORT", 5000)?,
            auto_start: parse_bool(var("AUTO_START"), true).context("AUTO_START must be true or false")?,
        })
    }

    pub fn layout(&self) -> RunLayout {
        RunLayout::new(&self.work_dir, &self.run_date)
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            runner: RunnerCommand {
                program: self.runner_program.clone(),
                args: self.runner_args.clone(),
                lookback_days: self.lookback_days,
            },
            grace: self.terminate_grace,
            success_policy: self.success_policy,
        }
    }

    /// Per-namespace dedup cache files live next to the run-date folders.
    pub fn dedup_dir(&self) -> PathBuf {
        self.work_dir.join("cache")
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number (got '{raw}')")),
        None => Ok(default),
    }
}

fn parse_bool(raw: Option<String>, default: bool) -> Result<bool> {
    match raw.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(s) => match s.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("unrecognized boolean '{other}'"),
        },
    }
}
