use {
    lazy_static::lazy_static,
    prometheus_client::{
        encoding::text::encode as encode_text,
        metrics::{
            counter::Counter,
            gauge::Gauge,
        },
        registry::Registry,
    },
    std::sync::{
        Mutex,
        PoisonError,
    },
};

lazy_static! {
    pub static ref PROMETHEUS_REGISTRY: Mutex<Registry> =
        Mutex::new(Registry::with_prefix("pyth_client"));
    static ref STREAM_METRICS: StreamMetrics =
        StreamMetrics::new(&mut PROMETHEUS_REGISTRY.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Metrics of the price account stream, shared by every stream in the process.
#[derive(Clone, Debug, Default)]
pub struct StreamMetrics {
    /// Number of subscriptions currently open.
    active_conns: Gauge,
    /// Number of account notifications received.
    events:       Counter,
}

impl StreamMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "ws_active_conns",
            "Number of active WebSocket subscriptions",
            metrics.active_conns.clone(),
        );
        registry.register(
            "ws_events",
            "Number of account notifications received",
            metrics.events.clone(),
        );
        metrics
    }

    pub fn global() -> &'static StreamMetrics {
        &STREAM_METRICS
    }

    /// Counts a subscription as active until the returned guard is dropped.
    pub fn connection(&self) -> ActiveConnection {
        self.active_conns.inc();
        ActiveConnection {
            gauge: self.active_conns.clone(),
        }
    }

    pub fn record_event(&self) {
        self.events.inc();
    }

    pub fn active_connections(&self) -> i64 {
        self.active_conns.get()
    }

    pub fn events(&self) -> u64 {
        self.events.get()
    }
}

pub struct ActiveConnection {
    gauge: Gauge,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Renders every registered metric in the Prometheus text format.
pub fn encode() -> Result<String, std::fmt::Error> {
    lazy_static::initialize(&STREAM_METRICS);
    let registry = PROMETHEUS_REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let mut buffer = String::new();
    encode_text(&mut buffer, &registry)?;
    Ok(buffer)
}
