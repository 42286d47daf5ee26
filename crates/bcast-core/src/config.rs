use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{domain::RecipientAddress, errors::Error, Result};

/// What to do when an audience names a list the store does not know.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingListPolicy {
    /// Fail resolution with `Error::NamedListNotFound`.
    #[default]
    Reject,
    /// Continue with the next audience branch (all known contacts).
    FallThrough,
}

impl FromStr for MissingListPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "reject" | "error" => Ok(Self::Reject),
            "fallthrough" | "fall_through" | "fallback" => Ok(Self::FallThrough),
            other => Err(Error::Config(format!(
                "BCAST_MISSING_LIST must be `reject` or `fallthrough`, got {other:?}"
            ))),
        }
    }
}

/// Typed configuration for the delivery engine.
#[derive(Clone, Debug)]
pub struct Config {
    // Batching
    pub batch_sizes: Vec<usize>,
    pub ramp_factor: f64,
    pub min_smart_send: usize,
    pub fast_batch_threshold: Duration,

    // Session learning
    pub learning_ttl: Duration,
    pub latency_smoothing: f64,
    pub learning_snapshot: Option<PathBuf>,

    // Retry queue
    pub queue_max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,

    // Fault isolation
    pub isolation_max_depth: u32,
    pub isolation_delay: Duration,

    // Addressing
    pub default_domain: String,
    pub broadcast_channel: RecipientAddress,
    pub missing_list: MissingListPolicy,

    // Transport
    pub send_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_sizes: vec![100, 500, 1000, 2000, 4000, 5000],
            ramp_factor: 1.5,
            min_smart_send: 100,
            fast_batch_threshold: Duration::from_millis(2000),
            learning_ttl: Duration::from_secs(24 * 60 * 60),
            latency_smoothing: 0.2,
            learning_snapshot: None,
            queue_max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(10_000),
            isolation_max_depth: 10,
            isolation_delay: Duration::from_millis(1000),
            default_domain: "s.whatsapp.net".to_string(),
            broadcast_channel: RecipientAddress::new("status@broadcast"),
            missing_list: MissingListPolicy::Reject,
            send_interval: Duration::ZERO,
        }
    }
}

impl Config {
    /// Defaults overridden by `BCAST_*` environment variables (and `.env`, if present).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut cfg = Self::default();

        if let Some(raw) = env_str("BCAST_BATCH_SIZES") {
            cfg.batch_sizes = parse_batch_sizes(&raw)?;
        }
        if let Some(v) = env_parse::<f64>("BCAST_RAMP_FACTOR")? {
            cfg.ramp_factor = v;
        }
        if let Some(v) = env_parse::<usize>("BCAST_MIN_SMART_SEND")? {
            cfg.min_smart_send = v;
        }
        if let Some(v) = env_parse::<u64>("BCAST_FAST_BATCH_MS")? {
            cfg.fast_batch_threshold = Duration::from_millis(v);
        }

        if let Some(v) = env_parse::<u64>("BCAST_LEARNING_TTL_SECS")? {
            cfg.learning_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<f64>("BCAST_LATENCY_SMOOTHING")? {
            cfg.latency_smoothing = v;
        }
        cfg.learning_snapshot = env_str("BCAST_LEARNING_SNAPSHOT")
            .and_then(non_empty)
            .map(PathBuf::from);

        if let Some(v) = env_parse::<u32>("BCAST_QUEUE_MAX_RETRIES")? {
            cfg.queue_max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("BCAST_BACKOFF_BASE_MS")? {
            cfg.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("BCAST_BACKOFF_CAP_MS")? {
            cfg.backoff_cap = Duration::from_millis(v);
        }

        if let Some(v) = env_parse::<u32>("BCAST_ISOLATION_MAX_DEPTH")? {
            cfg.isolation_max_depth = v;
        }
        if let Some(v) = env_parse::<u64>("BCAST_ISOLATION_DELAY_MS")? {
            cfg.isolation_delay = Duration::from_millis(v);
        }

        if let Some(v) = env_str("BCAST_DEFAULT_DOMAIN").and_then(non_empty) {
            cfg.default_domain = v.trim().trim_start_matches('@').to_string();
        }
        if let Some(v) = env_str("BCAST_CHANNEL").and_then(non_empty) {
            cfg.broadcast_channel = RecipientAddress::new(v.trim());
        }
        if let Some(v) = env_str("BCAST_MISSING_LIST").and_then(non_empty) {
            cfg.missing_list = v.parse()?;
        }

        if let Some(v) = env_parse::<u64>("BCAST_SEND_INTERVAL_MS")? {
            cfg.send_interval = Duration::from_millis(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot plan with.
    pub fn validate(&self) -> Result<()> {
        check_batch_sizes(&self.batch_sizes)?;
        if !self.ramp_factor.is_finite() || self.ramp_factor < 1.0 {
            return Err(Error::Config(format!(
                "ramp factor must be >= 1.0, got {}",
                self.ramp_factor
            )));
        }
        if !(self.latency_smoothing > 0.0 && self.latency_smoothing <= 1.0) {
            return Err(Error::Config(format!(
                "latency smoothing must be in (0, 1], got {}",
                self.latency_smoothing
            )));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(Error::Config(
                "backoff cap must not be below the backoff base".to_string(),
            ));
        }
        if self.default_domain.is_empty() {
            return Err(Error::Config("default domain is empty".to_string()));
        }
        Ok(())
    }
}

fn parse_batch_sizes(raw: &str) -> Result<Vec<usize>> {
    let sizes = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| Error::Config(format!("BCAST_BATCH_SIZES: {s:?} is not a size")))
        })
        .collect::<Result<Vec<_>>>()?;
    check_batch_sizes(&sizes)?;
    Ok(sizes)
}

fn check_batch_sizes(sizes: &[usize]) -> Result<()> {
    if sizes.is_empty() {
        return Err(Error::Config("batch size sequence is empty".to_string()));
    }
    if sizes[0] == 0 {
        return Err(Error::Config("batch sizes must be non-zero".to_string()));
    }
    if sizes.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::Config(format!(
            "batch sizes must be strictly ascending: {sizes:?}"
        )));
    }
    Ok(())
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    let Some(raw) = env_str(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw:?}")))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
