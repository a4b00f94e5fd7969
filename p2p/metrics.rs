//! Prometheus-backed counters and gauges for the discv5 core, mirroring the shape of
//! the teacher's own discovery metrics module: a lazily-initialized global registry plus
//! a handful of counters/gauges updated inline by the components that own the events.

use std::{
    collections::VecDeque,
    sync::{Arc, LazyLock},
    time::{Duration, SystemTime},
};

use prometheus::{Counter, Gauge, IntGauge, Registry};
use tokio::sync::Mutex;

pub static METRICS: LazyLock<DiscoveryMetrics> = LazyLock::new(DiscoveryMetrics::default);

#[derive(Debug, Clone)]
pub struct DiscoveryMetrics {
    pub registry: Registry,
    window_size: Duration,
    start_time: SystemTime,

    /// Current number of entries held across all routing-table buckets.
    pub routing_table_size: IntGauge,
    /// Current number of established (post-handshake) sessions.
    pub active_sessions: IntGauge,

    pub handshakes_initiated: Counter,
    pub handshakes_completed: Counter,
    pub handshakes_failed: Counter,

    pub lookups_started: Counter,
    lookup_events: Arc<Mutex<VecDeque<SystemTime>>>,
    pub lookups_rate: Gauge,

    pub pings_sent: Counter,
    pub pongs_received: Counter,
}

impl DiscoveryMetrics {
    /// Records a completed lookup and refreshes [`DiscoveryMetrics::lookups_rate`] over
    /// the trailing `window_size`.
    pub async fn record_lookup(&self) {
        self.lookups_started.inc();
        let mut events = self.lookup_events.lock().await;
        events.push_back(SystemTime::now());
        self.refresh_lookup_rate(&mut events).await;
    }

    async fn refresh_lookup_rate(&self, events: &mut VecDeque<SystemTime>) {
        let now = SystemTime::now();
        while let Some(&oldest) = events.front() {
            if now.duration_since(oldest).unwrap_or_default() > self.window_size {
                events.pop_front();
            } else {
                break;
            }
        }
        let elapsed = self.start_time.elapsed().unwrap_or_default().as_secs_f64();
        let window_secs = elapsed.min(self.window_size.as_secs_f64());
        let rate = if window_secs > 0.0 {
            events.len() as f64 / window_secs
        } else {
            0.0
        };
        self.lookups_rate.set(rate);
    }
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        let registry = Registry::new();

        macro_rules! register {
            ($metric:expr) => {{
                registry
                    .register(Box::new($metric.clone()))
                    .expect("metric name collision while registering discv5 metrics");
                $metric
            }};
        }

        let routing_table_size = register!(IntGauge::new(
            "discv5_routing_table_size",
            "Number of node-ids currently held in the routing table"
        )
        .expect("valid metric"));
        let active_sessions = register!(IntGauge::new(
            "discv5_active_sessions",
            "Number of established discv5 sessions"
        )
        .expect("valid metric"));
        let handshakes_initiated = register!(Counter::new(
            "discv5_handshakes_initiated_total",
            "Handshakes this node started as initiator"
        )
        .expect("valid metric"));
        let handshakes_completed = register!(Counter::new(
            "discv5_handshakes_completed_total",
            "Handshakes that reached an established session"
        )
        .expect("valid metric"));
        let handshakes_failed = register!(Counter::new(
            "discv5_handshakes_failed_total",
            "Handshakes aborted for any reason"
        )
        .expect("valid metric"));
        let lookups_started = register!(Counter::new(
            "discv5_lookups_started_total",
            "Iterative lookups started"
        )
        .expect("valid metric"));
        let lookups_rate = register!(Gauge::new(
            "discv5_lookups_rate",
            "Lookups completed per second over the trailing window"
        )
        .expect("valid metric"));
        let pings_sent = register!(Counter::new("discv5_pings_sent_total", "PING messages sent")
            .expect("valid metric"));
        let pongs_received = register!(Counter::new(
            "discv5_pongs_received_total",
            "PONG messages received"
        )
        .expect("valid metric"));

        DiscoveryMetrics {
            registry,
            window_size: Duration::from_secs(60),
            start_time: SystemTime::now(),
            routing_table_size,
            active_sessions,
            handshakes_initiated,
            handshakes_completed,
            handshakes_failed,
            lookups_started,
            lookup_events: Arc::new(Mutex::new(VecDeque::new())),
            lookups_rate,
            pings_sent,
            pongs_received,
        }
    }
}
