//! Per-peer message counters and request queue depth.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts};

/// `messages_sent_total`, `messages_received_total` and
/// `request_queue_length`, labelled by peer.
#[derive(Clone)]
pub struct ChannelMetrics {
    sent: IntCounterVec,
    received: IntCounterVec,
    queued: IntGaugeVec,
}

/// Series bound to one peer label.
#[derive(Clone)]
pub struct ChannelCounters {
    pub(crate) sent: IntCounter,
    pub(crate) received: IntCounter,
    /// Requests read off the wire and not yet taken by the consumer.
    pub(crate) queued: IntGauge,
}

impl ChannelMetrics {
    pub fn new(namespace: &str) -> prometheus::Result<Self> {
        let sent = IntCounterVec::new(
            Opts::new("messages_sent_total", "A total number of frames written to a channel.")
                .namespace(namespace)
                .subsystem("channel"),
            &["peer"],
        )?;
        let received = IntCounterVec::new(
            Opts::new(
                "messages_received_total",
                "A total number of frames read from a channel.",
            )
            .namespace(namespace)
            .subsystem("channel"),
            &["peer"],
        )?;
        let queued = IntGaugeVec::new(
            Opts::new(
                "request_queue_length",
                "Incoming requests waiting for the consumer, sampled as frames arrive.",
            )
            .namespace(namespace)
            .subsystem("channel"),
            &["peer"],
        )?;
        Ok(Self { sent, received, queued })
    }

    pub fn counters(&self, peer: &str) -> ChannelCounters {
        ChannelCounters {
            sent: self.sent.with_label_values(&[peer]),
            received: self.received.with_label_values(&[peer]),
            queued: self.queued.with_label_values(&[peer]),
        }
    }

    /// Drop the series of a peer that went away.
    pub fn forget(&self, peer: &str) {
        let _ = self.sent.remove_label_values(&[peer]);
        let _ = self.received.remove_label_values(&[peer]);
        let _ = self.queued.remove_label_values(&[peer]);
    }
}

impl Collector for ChannelMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.sent.desc();
        descs.extend(self.received.desc());
        descs.extend(self.queued.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.sent.collect();
        families.extend(self.received.collect());
        families.extend(self.queued.collect());
        families
    }
}
