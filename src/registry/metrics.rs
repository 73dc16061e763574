//! Registry metrics: connects, disconnects by reason, round trip and clock
//! drift, connected agents. Also carries the per-agent channel counters.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};

use crate::channel::{ChannelMetrics, NetworkInfo};

const SUBSYSTEM: &str = "agents";

#[derive(Clone)]
pub struct RegistryMetrics {
    pub(crate) connects: IntCounter,
    pub(crate) disconnects: IntCounterVec,
    pub(crate) round_trip: Histogram,
    pub(crate) clock_drift: Histogram,
    pub(crate) connected: IntGauge,
    pub(crate) channel: ChannelMetrics,
}

impl RegistryMetrics {
    pub fn new(namespace: &str) -> prometheus::Result<Self> {
        let connects = IntCounter::with_opts(
            Opts::new("connects_total", "A total number of agent connects.")
                .namespace(namespace)
                .subsystem(SUBSYSTEM),
        )?;
        let disconnects = IntCounterVec::new(
            Opts::new("disconnects_total", "A total number of agent disconnects.")
                .namespace(namespace)
                .subsystem(SUBSYSTEM),
            &["reason"],
        )?;
        let round_trip = Histogram::with_opts(
            HistogramOpts::new("round_trip_seconds", "Round-trip time.")
                .namespace(namespace)
                .subsystem(SUBSYSTEM)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let clock_drift = Histogram::with_opts(
            HistogramOpts::new("clock_drift_seconds", "Clock drift.")
                .namespace(namespace)
                .subsystem(SUBSYSTEM)
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 300.0]),
        )?;
        let connected = IntGauge::with_opts(
            Opts::new("connected", "The current number of connected agents.")
                .namespace(namespace)
                .subsystem(SUBSYSTEM),
        )?;

        // Export the label before the first disconnect happens.
        disconnects.with_label_values(&["unknown"]);

        Ok(Self {
            connects,
            disconnects,
            round_trip,
            clock_drift,
            connected,
            channel: ChannelMetrics::new(namespace)?,
        })
    }

    pub(crate) fn observe(&self, info: &NetworkInfo) {
        self.round_trip.observe(info.round_trip.as_secs_f64());
        let drift = info
            .clock_drift
            .abs()
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.clock_drift.observe(drift);
    }

    pub fn disconnects(&self, reason: &str) -> u64 {
        self.disconnects.with_label_values(&[reason]).get()
    }

    pub fn connects(&self) -> u64 {
        self.connects.get()
    }
}

impl Collector for RegistryMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = Vec::new();
        descs.extend(self.connects.desc());
        descs.extend(self.disconnects.desc());
        descs.extend(self.round_trip.desc());
        descs.extend(self.clock_drift.desc());
        descs.extend(self.connected.desc());
        descs.extend(self.channel.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.connects.collect());
        families.extend(self.disconnects.collect());
        families.extend(self.round_trip.collect());
        families.extend(self.clock_drift.collect());
        families.extend(self.connected.collect());
        families.extend(self.channel.collect());
        families
    }
}
