use super::MetricsSink;
use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub kind: MetricKind,
    pub namespace: String,
    pub name: String,
    pub value: f64,
}

/// Records every emission, in order
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    records: Mutex<Vec<MetricRecord>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }

    /// Number of emissions of `name`
    pub fn emissions(&self, name: &str) -> usize {
        self.records.lock().iter().filter(|r| r.name == name).count()
    }

    /// Sum of all counter values emitted under `name`
    pub fn counter_total(&self, name: &str) -> f64 {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind == MetricKind::Counter && r.name == name)
            .map(|r| r.value)
            .sum()
    }

    /// Most recent gauge value emitted under `name`
    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.kind == MetricKind::Gauge && r.name == name)
            .map(|r| r.value)
    }

    fn push(&self, kind: MetricKind, namespace: &str, name: &str, value: f64) {
        self.records.lock().push(MetricRecord {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            value,
        });
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetricsSink {
    async fn emit_counter(&self, namespace: &str, name: &str, value: f64) {
        self.push(MetricKind::Counter, namespace, name, value);
    }

    async fn emit_gauge(&self, namespace: &str, name: &str, value: f64) {
        self.push(MetricKind::Gauge, namespace, name, value);
    }
}
