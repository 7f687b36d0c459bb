//! Stats derivation.
//!
//! The engine hands back raw counters; dashboards expect the derived
//! values below, computed exactly this way:
//!
//! - CPU% = `(cpu_delta / system_delta) * online_cpus * 100`, deltas
//!   between successive reads; the first read reports 0.
//! - Memory% = `usage / limit * 100` when the limit is positive.
//! - Network rx/tx sum across all interfaces in the sample.
//! - Block rx/tx sum the entries labeled `Read` and `Write` across
//!   devices.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw counters from one engine stats call, engine-agnostic.
#[derive(Debug, Clone, Default)]
pub struct RawStats {
    pub cpu_total_usage: u64,
    pub cpu_system_usage: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
    /// Per-interface `(rx_bytes, tx_bytes)`.
    pub networks: Vec<(u64, u64)>,
    /// Per-device `(op, bytes)` as labeled by the engine.
    pub blkio: Vec<(String, u64)>,
    pub pids: u64,
}

/// A derived sample stored in the metrics ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
    /// How long the stats call itself took; a responsiveness signal.
    pub stat_call_ms: u64,
}

/// The previous read's CPU counters, kept per container.
#[derive(Debug, Clone, Copy)]
pub struct CpuBaseline {
    pub total_usage: u64,
    pub system_usage: u64,
}

/// Derive a snapshot from raw counters and the previous CPU baseline.
pub fn derive(
    raw: &RawStats,
    previous: Option<CpuBaseline>,
    stat_call: Duration,
) -> (StatsSnapshot, CpuBaseline) {
    let cpu_percent = match previous {
        Some(prev) => {
            let cpu_delta = raw.cpu_total_usage.saturating_sub(prev.total_usage) as f64;
            let system_delta = raw.cpu_system_usage.saturating_sub(prev.system_usage) as f64;
            if system_delta > 0.0 {
                (cpu_delta / system_delta) * raw.online_cpus.max(1) as f64 * 100.0
            } else {
                0.0
            }
        }
        None => 0.0,
    };

    let memory_percent = if raw.memory_limit > 0 {
        raw.memory_usage as f64 / raw.memory_limit as f64 * 100.0
    } else {
        0.0
    };

    let (net_rx, net_tx) = raw
        .networks
        .iter()
        .fold((0u64, 0u64), |(rx, tx), (irx, itx)| {
            (rx.saturating_add(*irx), tx.saturating_add(*itx))
        });

    let mut block_read = 0u64;
    let mut block_write = 0u64;
    for (op, value) in &raw.blkio {
        if op.eq_ignore_ascii_case("read") {
            block_read = block_read.saturating_add(*value);
        } else if op.eq_ignore_ascii_case("write") {
            block_write = block_write.saturating_add(*value);
        }
    }

    let snapshot = StatsSnapshot {
        at: Utc::now(),
        cpu_percent,
        memory_bytes: raw.memory_usage,
        memory_percent,
        net_rx_bytes: net_rx,
        net_tx_bytes: net_tx,
        block_read_bytes: block_read,
        block_write_bytes: block_write,
        pids: raw.pids,
        stat_call_ms: stat_call.as_millis() as u64,
    };
    let baseline = CpuBaseline {
        total_usage: raw.cpu_total_usage,
        system_usage: raw.cpu_system_usage,
    };
    (snapshot, baseline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawStats {
        RawStats {
            cpu_total_usage: 2_000,
            cpu_system_usage: 10_000,
            online_cpus: 4,
            memory_usage: 512 * 1024 * 1024,
            memory_limit: 2 * 1024 * 1024 * 1024,
            networks: vec![(100, 50), (400, 150)],
            blkio: vec![
                ("Read".to_string(), 1_000),
                ("Write".to_string(), 2_000),
                ("Read".to_string(), 500),
                ("Total".to_string(), 3_500),
            ],
            pids: 12,
        }
    }

    #[test]
    fn first_read_reports_zero_cpu() {
        let (snapshot, _) = derive(&raw(), None, Duration::from_millis(5));
        assert_eq!(snapshot.cpu_percent, 0.0);
    }

    #[test]
    fn cpu_percent_uses_deltas_and_core_count() {
        let (_, baseline) = derive(&raw(), None, Duration::from_millis(5));
        let mut second = raw();
        second.cpu_total_usage = 3_000; // +1000
        second.cpu_system_usage = 20_000; // +10000
        let (snapshot, _) = derive(&second, Some(baseline), Duration::from_millis(5));
        // 1000/10000 * 4 cores * 100 = 40%
        assert!((snapshot.cpu_percent - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn memory_percent_needs_a_limit() {
        let (snapshot, _) = derive(&raw(), None, Duration::from_millis(1));
        assert!((snapshot.memory_percent - 25.0).abs() < 0.001);

        let mut unlimited = raw();
        unlimited.memory_limit = 0;
        let (snapshot, _) = derive(&unlimited, None, Duration::from_millis(1));
        assert_eq!(snapshot.memory_percent, 0.0);
    }

    #[test]
    fn network_sums_all_interfaces() {
        let (snapshot, _) = derive(&raw(), None, Duration::from_millis(1));
        assert_eq!(snapshot.net_rx_bytes, 500);
        assert_eq!(snapshot.net_tx_bytes, 200);
    }

    #[test]
    fn blkio_sums_read_and_write_only() {
        let (snapshot, _) = derive(&raw(), None, Duration::from_millis(1));
        assert_eq!(snapshot.block_read_bytes, 1_500);
        assert_eq!(snapshot.block_write_bytes, 2_000);
    }

    #[test]
    fn counter_regression_does_not_underflow() {
        let (_, baseline) = derive(&raw(), None, Duration::from_millis(1));
        let mut rewound = raw();
        rewound.cpu_total_usage = 0;
        rewound.cpu_system_usage = 0;
        let (snapshot, _) = derive(&rewound, Some(baseline), Duration::from_millis(1));
        assert_eq!(snapshot.cpu_percent, 0.0);
    }

    #[test]
    fn stat_call_duration_is_recorded() {
        let (snapshot, _) = derive(&raw(), None, Duration::from_millis(123));
        assert_eq!(snapshot.stat_call_ms, 123);
    }
}
