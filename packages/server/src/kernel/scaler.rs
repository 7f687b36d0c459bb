//! Auto-scaler: derive desired pool sizes from queue pressure,
//! utilization, and forecast demand.
//!
//! The scaler only *decides*; the pool manager applies. Scale-up fires
//! when any signal trips; scale-down requires every signal quiet plus
//! an elapsed cooldown, and never drops below the number of busy
//! runners.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScalerConfig;
use crate::kernel::jobs::Job;
use crate::kernel::pools::PoolManager;
use crate::telemetry::{EventSink, MetricsSink, OrchestratorEvent};

/// Everything the decision rule needs for one pool, one tick.
#[derive(Debug, Clone, Copy)]
pub struct PoolSignals {
    pub waiting: u64,
    pub idle: usize,
    pub busy: usize,
    pub total: usize,
    pub current_desired: usize,
    pub util_ewma: f64,
    /// Predicted arrivals next interval, when forecasting is on.
    pub forecast_arrivals: f64,
    pub cooldown_up_elapsed: bool,
    pub cooldown_down_elapsed: bool,
}

/// A scale decision with the signal that drove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Up { to: usize, reason: &'static str },
    Down { to: usize, reason: &'static str },
    Hold,
}

/// The pure decision rule. See §module docs for the policy.
pub fn decide(signals: &PoolSignals, config: &ScalerConfig) -> Decision {
    let pressure = signals.waiting as f64 / signals.idle.max(1) as f64;

    // Scale up if any signal fires.
    let mut up_by = 0usize;
    let mut reason = "";
    let excess = pressure - config.target_pressure;
    if excess > 0.0 {
        up_by = excess.ceil() as usize;
        reason = "queue_pressure";
    }
    if signals.util_ewma > config.up_threshold {
        up_by = up_by.max(1);
        if reason.is_empty() {
            reason = "utilization";
        }
    }
    if signals.forecast_arrivals > signals.idle as f64 {
        up_by = up_by.max(1);
        if reason.is_empty() {
            reason = "forecast";
        }
    }

    if up_by > 0 {
        if !signals.cooldown_up_elapsed {
            return Decision::Hold;
        }
        let to = (signals.current_desired + up_by).max(signals.busy);
        return Decision::Up { to, reason };
    }

    // Scale down only when everything is quiet.
    let quiet = signals.util_ewma < config.down_threshold && pressure < 1.0;
    if quiet && signals.cooldown_down_elapsed && signals.current_desired > 0 {
        let to = signals.current_desired.saturating_sub(1).max(signals.busy);
        if to < signals.current_desired {
            return Decision::Down {
                to,
                reason: "quiet",
            };
        }
    }

    Decision::Hold
}

/// Least-squares slope of `(x, y)` points; 0 for degenerate inputs.
fn regression_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    if points.len() < 2 {
        return 0.0;
    }
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let numerator: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let denominator: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if denominator.abs() < f64::EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

const ARRIVAL_HISTORY: usize = 20;

#[derive(Debug, Default)]
struct PoolTrack {
    util_ewma: f64,
    last_scale_up: Option<DateTime<Utc>>,
    last_scale_down: Option<DateTime<Utc>>,
    /// Arrivals per tick, newest last.
    arrivals: VecDeque<f64>,
    last_arrival_total: Option<i64>,
    desired: usize,
}

/// The periodic evaluation loop.
pub struct AutoScaler {
    db: PgPool,
    pools: Arc<PoolManager>,
    config: ScalerConfig,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    tracks: Mutex<HashMap<String, PoolTrack>>,
}

impl AutoScaler {
    pub fn new(
        db: PgPool,
        pools: Arc<PoolManager>,
        config: ScalerConfig,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            db,
            pools,
            config,
            events,
            metrics,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "auto-scaler started"
        );
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.evaluate_all().await {
                        warn!(error = %e, "scaler evaluation failed");
                    }
                }
            }
        }
        info!("auto-scaler stopped");
    }

    /// One evaluation pass across every known pool.
    pub async fn evaluate_all(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let waiting: HashMap<String, i64> =
            Job::waiting_by_pool(self.pools_db()).await?.into_iter().collect();
        let demand = self.pools.take_demand();
        let since = now
            - chrono::Duration::from_std(self.config.interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let arrivals: HashMap<String, i64> =
            Job::arrivals_by_pool_since(since, self.pools_db())
                .await?
                .into_iter()
                .collect();

        let mut pool_keys: HashSet<String> = self.pools.live_pool_keys().await?.into_iter().collect();
        pool_keys.extend(waiting.keys().cloned());
        pool_keys.extend(demand.keys().cloned());

        for pool_key in pool_keys {
            let counts = self.pools.counts(&pool_key).await?;
            let waiting_jobs = waiting.get(&pool_key).copied().unwrap_or(0).max(0) as u64;
            let arrived = arrivals.get(&pool_key).copied().unwrap_or(0) as f64;

            let signals = {
                let mut tracks = self.lock_tracks();
                let track = tracks.entry(pool_key.clone()).or_default();

                let util_raw = counts.busy as f64 / counts.total().max(1) as f64;
                track.util_ewma = self.config.ewma_alpha * util_raw
                    + (1.0 - self.config.ewma_alpha) * track.util_ewma;

                track.arrivals.push_back(arrived);
                if track.arrivals.len() > ARRIVAL_HISTORY {
                    track.arrivals.pop_front();
                }
                let forecast = if self.config.forecast {
                    let points: Vec<(f64, f64)> = track
                        .arrivals
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (i as f64, *v))
                        .collect();
                    let slope = regression_slope(&points);
                    (arrived + slope).max(0.0)
                } else {
                    0.0
                };

                if track.desired == 0 {
                    track.desired = counts.total().saturating_sub(counts.draining);
                }

                PoolSignals {
                    waiting: waiting_jobs,
                    idle: counts.idle,
                    busy: counts.busy,
                    total: counts.total(),
                    current_desired: track.desired,
                    util_ewma: track.util_ewma,
                    forecast_arrivals: forecast,
                    cooldown_up_elapsed: cooldown_elapsed(
                        track.last_scale_up,
                        self.config.cooldown_up,
                        now,
                    ),
                    cooldown_down_elapsed: cooldown_elapsed(
                        track.last_scale_down,
                        self.config.cooldown_down,
                        now,
                    ),
                }
            };

            self.metrics.gauge(
                "pool_utilization",
                signals.util_ewma,
                &[("pool", pool_key.clone())],
            );
            self.metrics.gauge(
                "pool_waiting",
                signals.waiting as f64,
                &[("pool", pool_key.clone())],
            );

            match decide(&signals, &self.config) {
                Decision::Up { to, reason } => {
                    self.apply(&pool_key, signals.current_desired, to, reason, now, true)
                        .await;
                }
                Decision::Down { to, reason } => {
                    self.apply(&pool_key, signals.current_desired, to, reason, now, false)
                        .await;
                }
                Decision::Hold => {
                    debug!(pool = %pool_key, "scaler holding");
                }
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        pool_key: &str,
        from: usize,
        to: usize,
        reason: &'static str,
        now: DateTime<Utc>,
        up: bool,
    ) {
        if let Err(e) = self.pools.scale(pool_key, to).await {
            warn!(pool = %pool_key, error = %e, "scale application failed");
            return;
        }

        {
            let mut tracks = self.lock_tracks();
            if let Some(track) = tracks.get_mut(pool_key) {
                track.desired = to;
                if up {
                    track.last_scale_up = Some(now);
                } else {
                    track.last_scale_down = Some(now);
                }
            }
        }

        info!(pool = %pool_key, from, to, reason, "pool scaled");
        self.events.emit(OrchestratorEvent::PoolScaled {
            pool_key: pool_key.to_string(),
            from,
            to,
            reason: reason.to_string(),
        });
    }

    fn pools_db(&self) -> &PgPool {
        &self.db
    }

    fn lock_tracks(&self) -> std::sync::MutexGuard<'_, HashMap<String, PoolTrack>> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn cooldown_elapsed(
    last: Option<DateTime<Utc>>,
    cooldown: std::time::Duration,
    now: DateTime<Utc>,
) -> bool {
    match last {
        None => true,
        Some(at) => {
            let cooldown = chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            now - at >= cooldown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> ScalerConfig {
        ScalerConfig {
            interval: Duration::from_secs(30),
            target_pressure: 1.0,
            up_threshold: 0.8,
            down_threshold: 0.3,
            cooldown_up: Duration::from_secs(60),
            cooldown_down: Duration::from_secs(300),
            ewma_alpha: 0.3,
            forecast: true,
        }
    }

    fn signals() -> PoolSignals {
        PoolSignals {
            waiting: 0,
            idle: 2,
            busy: 1,
            total: 3,
            current_desired: 3,
            util_ewma: 0.4,
            forecast_arrivals: 0.0,
            cooldown_up_elapsed: true,
            cooldown_down_elapsed: true,
        }
    }

    #[test]
    fn pressure_drives_scale_up_by_excess() {
        let mut s = signals();
        s.waiting = 8; // pressure 4.0, target 1.0 -> up by 3
        match decide(&s, &config()) {
            Decision::Up { to, reason } => {
                assert_eq!(to, 6);
                assert_eq!(reason, "queue_pressure");
            }
            other => panic!("expected Up, got {other:?}"),
        }
    }

    #[test]
    fn high_utilization_scales_up_by_one() {
        let mut s = signals();
        s.util_ewma = 0.9;
        assert_eq!(
            decide(&s, &config()),
            Decision::Up {
                to: 4,
                reason: "utilization"
            }
        );
    }

    #[test]
    fn forecast_beyond_idle_scales_up() {
        let mut s = signals();
        s.forecast_arrivals = 5.0;
        assert_eq!(
            decide(&s, &config()),
            Decision::Up {
                to: 4,
                reason: "forecast"
            }
        );
    }

    #[test]
    fn up_respects_cooldown() {
        let mut s = signals();
        s.waiting = 10;
        s.cooldown_up_elapsed = false;
        assert_eq!(decide(&s, &config()), Decision::Hold);
    }

    #[test]
    fn quiet_pool_scales_down_by_one() {
        let mut s = signals();
        s.util_ewma = 0.1;
        s.waiting = 0;
        assert_eq!(
            decide(&s, &config()),
            Decision::Down {
                to: 2,
                reason: "quiet"
            }
        );
    }

    #[test]
    fn down_requires_every_signal_quiet() {
        let mut s = signals();
        s.util_ewma = 0.1;
        s.waiting = 4; // pressure 2.0 -> up wins instead
        assert!(matches!(decide(&s, &config()), Decision::Up { .. }));

        let mut s = signals();
        s.util_ewma = 0.5; // not below down_threshold
        assert_eq!(decide(&s, &config()), Decision::Hold);

        let mut s = signals();
        s.util_ewma = 0.1;
        s.cooldown_down_elapsed = false;
        assert_eq!(decide(&s, &config()), Decision::Hold);
    }

    #[test]
    fn never_scales_below_busy_runners() {
        let mut s = signals();
        s.util_ewma = 0.1;
        s.busy = 3;
        s.current_desired = 3;
        // Down would go to 2 but busy = 3 pins it; no-op means Hold.
        assert_eq!(decide(&s, &config()), Decision::Hold);
    }

    #[test]
    fn regression_slope_of_rising_series_is_positive() {
        let points: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, (i * 2) as f64)).collect();
        assert!((regression_slope(&points) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn regression_slope_handles_degenerate_input() {
        assert_eq!(regression_slope(&[]), 0.0);
        assert_eq!(regression_slope(&[(0.0, 5.0)]), 0.0);
        let flat: Vec<(f64, f64)> = (0..5).map(|i| (i as f64, 3.0)).collect();
        assert_eq!(regression_slope(&flat), 0.0);
    }

    #[test]
    fn cooldown_elapses_after_window() {
        let now = Utc::now();
        assert!(cooldown_elapsed(None, Duration::from_secs(60), now));
        assert!(!cooldown_elapsed(
            Some(now - chrono::Duration::seconds(30)),
            Duration::from_secs(60),
            now
        ));
        assert!(cooldown_elapsed(
            Some(now - chrono::Duration::seconds(61)),
            Duration::from_secs(60),
            now
        ));
    }
}
