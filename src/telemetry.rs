//! Lightweight telemetry facade: named counters plus HDR latency histograms,
//! kept in memory so tests can assert instrumentation.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::Arc,
    time::SystemTime,
};
use thiserror::Error;

fn default_flush_interval_ms() -> u64 {
    5_000
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Flush cadence in milliseconds (used by the CLI runner's periodic report).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Global labels appended to every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TelemetryConfig {
    pub fn sample(component: &str) -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::from([("component".into(), component.into())]),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::sample("bitnun-node")
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub p50: u64,
    pub p95: u64,
    pub max: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub timestamp: SystemTime,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub latencies_ms: BTreeMap<String, LatencySummary>,
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    latencies_ms: BTreeMap<String, Histogram<u64>>,
}

#[derive(Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
    state: Arc<Mutex<TelemetryState>>,
}

impl TelemetryHandle {
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TelemetryState::default())),
        }
    }

    pub fn record_counter(&self, name: &str, delta: u64) -> Result<(), TelemetryError> {
        let mut guard = self.state.lock();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    /// Counter bump for call sites that treat telemetry as best-effort.
    pub fn incr(&self, name: &str) {
        if let Err(e) = self.record_counter(name, 1) {
            tracing::debug!(error = %e, "telemetry counter dropped");
        }
    }

    /// Best-effort like `incr`: a sample that cannot be recorded is logged and dropped.
    pub fn record_latency_ms(&self, name: &str, value: u64) {
        let mut guard = self.state.lock();
        let histo = match guard.latencies_ms.entry(name.to_owned()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => match Histogram::new(3) {
                Ok(histo) => slot.insert(histo),
                Err(e) => {
                    tracing::debug!(error = %e, metric = name, "latency histogram unavailable");
                    return;
                }
            },
        };
        if let Err(e) = histo.record(value.max(1)) {
            tracing::debug!(error = %e, metric = name, "latency sample dropped");
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.state.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Takes a snapshot and resets all state.
    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.state.lock();
        let snapshot = TelemetrySnapshot {
            timestamp: SystemTime::now(),
            labels: self.config.labels.clone(),
            counters: guard.counters.clone(),
            latencies_ms: guard
                .latencies_ms
                .iter()
                .map(|(k, h)| {
                    (
                        k.clone(),
                        LatencySummary {
                            count: h.len(),
                            p50: h.value_at_quantile(0.50),
                            p95: h.value_at_quantile(0.95),
                            max: h.max(),
                        },
                    )
                })
                .collect(),
        };
        guard.counters.clear();
        guard.latencies_ms.clear();
        snapshot
    }

    pub fn flush_interval(&self) -> u64 {
        self.config.flush_interval_ms
    }
}

impl Default for TelemetryHandle {
    fn default() -> Self {
        Self::from_config(TelemetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TelemetryHandle {
        TelemetryHandle::from_config(TelemetryConfig::sample("test"))
    }

    #[test]
    fn records_counters_and_latencies() {
        let handle = handle();
        handle.record_counter("actions.accepted", 1).unwrap();
        handle.record_counter("actions.accepted", 2).unwrap();
        handle.record_latency_ms("mining.block_ms", 42);
        let snapshot = handle.flush();
        assert_eq!(snapshot.counters["actions.accepted"], 3);
        assert_eq!(snapshot.latencies_ms["mining.block_ms"].count, 1);
        assert_eq!(snapshot.labels["component"], "test");
    }

    #[test]
    fn latency_samples_share_one_histogram_per_metric() {
        let handle = handle();
        handle.record_latency_ms("sync.round_trip_ms", 0);
        handle.record_latency_ms("sync.round_trip_ms", 250);
        handle.record_latency_ms("bots.run_ms", 7);
        let snapshot = handle.flush();
        assert_eq!(snapshot.latencies_ms["sync.round_trip_ms"].count, 2);
        assert_eq!(snapshot.latencies_ms["bots.run_ms"].count, 1);
    }

    #[test]
    fn detects_counter_overflow() {
        let handle = handle();
        handle.record_counter("blocks.mined", u64::MAX).unwrap();
        let err = handle.record_counter("blocks.mined", 1).unwrap_err();
        assert!(matches!(err, TelemetryError::CounterOverflow(_)));
    }

    #[test]
    fn flush_clears_state() {
        let handle = handle();
        handle.incr("sync.success");
        handle.flush();
        let second = handle.flush();
        assert!(second.counters.is_empty());
        assert!(second.latencies_ms.is_empty());
    }
}
