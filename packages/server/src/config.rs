use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
///
/// Every option has a default so a bare environment (plus `DATABASE_URL`
/// and `INTAKE_SIGNATURE_SECRET`) boots a working orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub intake: IntakeConfig,
    pub queues: Vec<QueueSettings>,
    pub dispatch: DispatchConfig,
    pub pools: PoolConfig,
    pub scaler: ScalerConfig,
    pub monitor: MonitorConfig,
    pub cleanup: CleanupConfig,
    pub scanner: ScannerConfig,
    pub control: ControlConfig,
    pub docker: DockerConfig,
    pub runner: RunnerConfig,
    pub router: RouterConfig,
    /// `category=bool` overrides for the retry classification table.
    pub retry_classification: Vec<(String, String)>,
}

/// Routing rule tables, both `pattern=value` lists.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Repository pattern to profile name.
    pub rules: Vec<(String, String)>,
    /// Repository pattern to tier (`gold`/`silver`/`bronze`).
    pub tiers: Vec<(String, String)>,
}

/// Webhook intake settings.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Shared secret for the HMAC-SHA256 signature over the raw body.
    pub signature_secret: String,
    /// How long delivery ids are remembered for dedup. Floor: 24 h.
    pub dedup_ttl: Duration,
    /// Signature mismatches within `flood_window` before a security
    /// event fires.
    pub flood_threshold: u32,
    pub flood_window: Duration,
}

/// One named queue: concurrency, rate, round-robin weight, retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub name: String,
    pub concurrency_limit: usize,
    pub rate_limit: Option<u32>,
    pub weight: u32,
    pub retry_base: Duration,
    pub retry_factor: f64,
    pub retry_cap: Duration,
    pub retry_jitter_min: f64,
    pub retry_jitter_max: f64,
    pub dead_letter_name: String,
    pub retention_window: Duration,
}

/// Queue engine timing.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub tick: Duration,
    pub handoff_timeout: Duration,
    pub handoff_capacity: usize,
    pub max_attempts_default: u32,
}

/// Runner pool bounds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    /// Ephemeral pools terminate a runner after one job.
    pub ephemeral: bool,
}

/// Auto-scaler thresholds and cadence.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub interval: Duration,
    pub target_pressure: f64,
    pub up_threshold: f64,
    pub down_threshold: f64,
    pub cooldown_up: Duration,
    pub cooldown_down: Duration,
    /// Smoothing factor for the utilization EWMA, in (0, 1].
    pub ewma_alpha: f64,
    /// Enable the linear-regression arrival forecast.
    pub forecast: bool,
}

/// Container monitoring loop settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub response_threshold: Duration,
    /// A predicate must stay quiet this long before its alert resolves.
    pub alert_cooldown: Duration,
    /// Samples kept per container in the metrics ring.
    pub ring_capacity: usize,
}

/// Cleanup reaper cadence and retention windows.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub container_ttl: Duration,
    pub job_retention: Duration,
    pub metrics_retention: Duration,
    pub pool_idle_ttl: Duration,
}

/// Secret scanner settings.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Extra patterns appended to the built-in table, comma separated.
    pub extra_patterns: Vec<String>,
}

/// Control loop settings.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub shutdown_timeout: Duration,
    pub auto_restart: bool,
}

/// Container engine access.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Bound on concurrent engine-socket calls.
    pub max_inflight: usize,
    pub rpc_timeout: Duration,
    pub stop_grace: Duration,
}

/// Runner container defaults and the creation allow-list.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub default_image: String,
    /// Image references must start with one of these prefixes.
    pub allowed_image_prefixes: Vec<String>,
    /// Host paths that may be bind-mounted, as prefixes.
    pub allowed_bind_paths: Vec<String>,
    pub max_execution: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let queue_spec = env::var("QUEUE_SPEC")
            .unwrap_or_else(|_| "critical:8:20:4,default:16:50:2,heavy:4:10:1,gpu:2:5:1".into());
        let retry_base = ms("RETRY_BASE_MS", 1_000)?;
        let retry_factor = num("RETRY_FACTOR", 2.0)?;
        let retry_cap = ms("RETRY_CAP_MS", 10_000)?;
        let retention = ms("QUEUE_RETENTION_MS", 24 * 60 * 60 * 1_000)?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: num("PORT", 8080u16)?,
            intake: IntakeConfig {
                signature_secret: env::var("INTAKE_SIGNATURE_SECRET")
                    .context("INTAKE_SIGNATURE_SECRET must be set")?,
                dedup_ttl: ms("INTAKE_DEDUP_TTL_MS", 24 * 60 * 60 * 1_000)?
                    .max(Duration::from_secs(24 * 60 * 60)),
                flood_threshold: num("INTAKE_FLOOD_THRESHOLD", 10u32)?,
                flood_window: ms("INTAKE_FLOOD_WINDOW_MS", 60_000)?,
            },
            queues: parse_queue_spec(
                &queue_spec,
                retry_base,
                retry_factor,
                retry_cap,
                retention,
            )?,
            dispatch: DispatchConfig {
                tick: ms("DISPATCH_TICK_MS", 100)?,
                handoff_timeout: ms("DISPATCH_HANDOFF_TIMEOUT_MS", 5_000)?,
                handoff_capacity: num("DISPATCH_HANDOFF_CAPACITY", 64usize)?,
                max_attempts_default: num("JOB_MAX_ATTEMPTS", 3u32)?,
            },
            pools: PoolConfig {
                min: num("POOL_MIN", 1usize)?,
                max: num("POOL_MAX", 10usize)?,
                ephemeral: flag("POOL_EPHEMERAL", true)?,
            },
            scaler: ScalerConfig {
                interval: ms("SCALER_INTERVAL_MS", 30_000)?,
                target_pressure: num("SCALER_TARGET_PRESSURE", 1.0)?,
                up_threshold: num("SCALER_UP_THRESHOLD", 0.8)?,
                down_threshold: num("SCALER_DOWN_THRESHOLD", 0.3)?,
                cooldown_up: ms("SCALER_COOLDOWN_UP_MS", 60_000)?,
                cooldown_down: ms("SCALER_COOLDOWN_DOWN_MS", 300_000)?,
                ewma_alpha: num("SCALER_EWMA_ALPHA", 0.3)?,
                forecast: flag("SCALER_FORECAST", true)?,
            },
            monitor: MonitorConfig {
                interval: ms("CONTAINER_MONITORING_INTERVAL_MS", 20_000)?,
                cpu_threshold: num("CONTAINER_ALERT_CPU", 80.0)?,
                memory_threshold: num("CONTAINER_ALERT_MEMORY", 85.0)?,
                response_threshold: ms("CONTAINER_ALERT_RESPONSE_MS", 5_000)?,
                alert_cooldown: ms("CONTAINER_ALERT_COOLDOWN_MS", 120_000)?,
                ring_capacity: num("CONTAINER_METRICS_RING", 120usize)?,
            },
            cleanup: CleanupConfig {
                interval: ms("CLEANUP_INTERVAL_MS", 60_000)?,
                container_ttl: ms("CLEANUP_CONTAINER_TTL_MS", 30 * 60 * 1_000)?,
                job_retention: ms("CLEANUP_JOB_RETENTION_MS", 7 * 24 * 60 * 60 * 1_000)?,
                metrics_retention: ms("CLEANUP_METRICS_RETENTION_MS", 60 * 60 * 1_000)?,
                pool_idle_ttl: ms("CLEANUP_POOL_IDLE_TTL_MS", 60 * 60 * 1_000)?,
            },
            scanner: ScannerConfig {
                extra_patterns: env::var("SCANNER_EXTRA_PATTERNS")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|p| !p.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            control: ControlConfig {
                shutdown_timeout: ms("CONTROL_SHUTDOWN_TIMEOUT_MS", 30_000)?,
                auto_restart: flag("CONTROL_AUTO_RESTART", false)?,
            },
            docker: DockerConfig {
                max_inflight: num("DOCKER_MAX_INFLIGHT", 50usize)?,
                rpc_timeout: ms("DOCKER_RPC_TIMEOUT_MS", 30_000)?,
                stop_grace: ms("DOCKER_STOP_GRACE_MS", 30_000)?,
            },
            runner: RunnerConfig {
                default_image: env::var("RUNNER_DEFAULT_IMAGE")
                    .unwrap_or_else(|_| "ghcr.io/runfleet/runner:latest".into()),
                allowed_image_prefixes: list(
                    "RUNNER_ALLOWED_IMAGE_PREFIXES",
                    &["ghcr.io/runfleet/", "docker.io/runfleet/"],
                ),
                allowed_bind_paths: list("RUNNER_ALLOWED_BIND_PATHS", &["/var/cache/runfleet"]),
                max_execution: ms("RUNNER_MAX_EXECUTION_MS", 60 * 60 * 1_000)?,
            },
            router: RouterConfig {
                rules: pairs("ROUTER_RULES")?,
                tiers: pairs("ROUTER_TIERS")?,
            },
            retry_classification: pairs("RETRY_CLASSIFICATION")?,
        })
    }

    /// The queue settings for `name`, if configured.
    pub fn queue(&self, name: &str) -> Option<&QueueSettings> {
        self.queues.iter().find(|q| q.name == name)
    }
}

/// Parse `name:concurrency:rate:weight` tuples, comma separated.
///
/// A rate of `0` means unmetered.
fn parse_queue_spec(
    spec: &str,
    retry_base: Duration,
    retry_factor: f64,
    retry_cap: Duration,
    retention: Duration,
) -> Result<Vec<QueueSettings>> {
    let mut queues = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let fields: Vec<&str> = part.split(':').collect();
        if fields.len() != 4 {
            bail!("queue spec entry '{part}' must be name:concurrency:rate:weight");
        }
        let name = fields[0].to_string();
        if name.is_empty() {
            bail!("queue spec entry '{part}' has an empty name");
        }
        let concurrency: usize = fields[1]
            .parse()
            .with_context(|| format!("bad concurrency in '{part}'"))?;
        let rate: u32 = fields[2]
            .parse()
            .with_context(|| format!("bad rate in '{part}'"))?;
        let weight: u32 = fields[3]
            .parse()
            .with_context(|| format!("bad weight in '{part}'"))?;
        queues.push(QueueSettings {
            dead_letter_name: format!("{name}-dead-letter"),
            name,
            concurrency_limit: concurrency.max(1),
            rate_limit: (rate > 0).then_some(rate),
            weight: weight.max(1),
            retry_base,
            retry_factor,
            retry_cap,
            retry_jitter_min: 0.5,
            retry_jitter_max: 1.5,
            retention_window: retention,
        });
    }
    if queues.is_empty() {
        bail!("queue spec '{spec}' configures no queues");
    }
    Ok(queues)
}

fn num<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn ms(key: &str, default_ms: u64) -> Result<Duration> {
    Ok(Duration::from_millis(num(key, default_ms)?))
}

fn flag(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{key} must be a boolean, got '{other}'"),
        },
        Err(_) => Ok(default),
    }
}

/// Parse `pattern=value` pairs, comma separated. Empty when unset.
fn pairs(key: &str) -> Result<Vec<(String, String)>> {
    let Ok(raw) = env::var(key) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (pattern, value) = part
            .split_once('=')
            .with_context(|| format!("{key} entry '{part}' must be pattern=value"))?;
        out.push((pattern.trim().to_string(), value.trim().to_string()));
    }
    Ok(out)
}

fn list(key: &str, defaults: &[&str]) -> Vec<String> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_else(|_| defaults.iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(spec: &str) -> Result<Vec<QueueSettings>> {
        parse_queue_spec(
            spec,
            Duration::from_millis(1_000),
            2.0,
            Duration::from_millis(10_000),
            Duration::from_secs(86_400),
        )
    }

    #[test]
    fn parses_multiple_queues() {
        let queues = parse("critical:8:20:4,default:16:50:2").unwrap();
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].name, "critical");
        assert_eq!(queues[0].concurrency_limit, 8);
        assert_eq!(queues[0].rate_limit, Some(20));
        assert_eq!(queues[0].weight, 4);
        assert_eq!(queues[1].name, "default");
    }

    #[test]
    fn zero_rate_means_unmetered() {
        let queues = parse("default:4:0:1").unwrap();
        assert_eq!(queues[0].rate_limit, None);
    }

    #[test]
    fn dead_letter_name_derives_from_queue() {
        let queues = parse("gpu:2:5:1").unwrap();
        assert_eq!(queues[0].dead_letter_name, "gpu-dead-letter");
    }

    #[test]
    fn malformed_entry_is_rejected() {
        assert!(parse("default:4:1").is_err());
        assert!(parse("default:x:1:1").is_err());
        assert!(parse(":4:1:1").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn concurrency_and_weight_floors() {
        let queues = parse("default:0:0:0").unwrap();
        assert_eq!(queues[0].concurrency_limit, 1);
        assert_eq!(queues[0].weight, 1);
    }
}
