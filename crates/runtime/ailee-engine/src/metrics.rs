use lazy_static::lazy_static;
use prometheus::{opts, IntCounter, IntGauge, Registry};

/// Prometheus instruments for the engine. Built against an explicit
/// registry so tests can run with a private one; the process default
/// registry backs the shared instance below.
#[derive(Clone)]
pub struct EngineInstruments {
    pub tasks_submitted: IntCounter,
    pub tasks_completed: IntCounter,
    pub tasks_failed: IntCounter,
    pub tasks_retried: IntCounter,
    pub queue_depth: IntGauge,
    pub active_nodes: IntGauge,
}

impl EngineInstruments {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let tasks_submitted = IntCounter::with_opts(opts!(
            "ailee_engine_tasks_submitted_total",
            "Tasks dequeued for processing"
        ))?;
        let tasks_completed = IntCounter::with_opts(opts!(
            "ailee_engine_tasks_completed_total",
            "Tasks that finished successfully"
        ))?;
        let tasks_failed = IntCounter::with_opts(opts!(
            "ailee_engine_tasks_failed_total",
            "Tasks that terminally failed"
        ))?;
        let tasks_retried = IntCounter::with_opts(opts!(
            "ailee_engine_tasks_retried_total",
            "Task attempts requeued after retriable failures"
        ))?;
        let queue_depth = IntGauge::with_opts(opts!(
            "ailee_engine_queue_depth",
            "Tasks currently waiting in the priority queue"
        ))?;
        let active_nodes = IntGauge::with_opts(opts!(
            "ailee_engine_active_nodes",
            "Workers currently present in the node registry"
        ))?;

        registry.register(Box::new(tasks_submitted.clone()))?;
        registry.register(Box::new(tasks_completed.clone()))?;
        registry.register(Box::new(tasks_failed.clone()))?;
        registry.register(Box::new(tasks_retried.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_nodes.clone()))?;

        Ok(Self {
            tasks_submitted,
            tasks_completed,
            tasks_failed,
            tasks_retried,
            queue_depth,
            active_nodes,
        })
    }
}

lazy_static! {
    /// Process-wide instruments on the default registry.
    pub static ref ENGINE_INSTRUMENTS: EngineInstruments =
        EngineInstruments::new(prometheus::default_registry())
            .expect("engine metrics registration");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_registry_keeps_tests_isolated() {
        let registry = Registry::new();
        let instruments = EngineInstruments::new(&registry).unwrap();
        instruments.tasks_submitted.inc();
        instruments.queue_depth.set(3);
        assert_eq!(instruments.tasks_submitted.get(), 1);
        assert_eq!(instruments.queue_depth.get(), 3);
        // Registering twice on the same registry collides.
        assert!(EngineInstruments::new(&registry).is_err());
        // A second private registry starts from zero.
        let other = EngineInstruments::new(&Registry::new()).unwrap();
        assert_eq!(other.tasks_submitted.get(), 0);
    }
}
