use crate::engine::{lock_status, SharedStatus};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.footfall.Counter1";
pub const OBJECT_PATH: &str = "/org/footfall/Counter1";

/// D-Bus interface for the footfall counting daemon.
///
/// Bus name: org.footfall.Counter1
/// Object path: /org/footfall/Counter1
pub struct CounterService {
    status: SharedStatus,
}

impl CounterService {
    pub fn new(status: SharedStatus) -> Self {
        Self { status }
    }
}

#[interface(name = "org.footfall.Counter1")]
impl CounterService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = lock_status(&self.status).clone();
        let mut json = serde_json::to_value(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        json["version"] = serde_json::json!(env!("CARGO_PKG_VERSION"));
        Ok(json.to_string())
    }

    /// Pipeline counters since startup.
    async fn stats(&self) -> zbus::fdo::Result<String> {
        let stats = lock_status(&self.status).stats.clone();
        serde_json::to_string(&stats).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Most recent recorded visit, or `null`.
    async fn last_visit(&self) -> zbus::fdo::Result<String> {
        let visit = lock_status(&self.status).last_visit.clone();
        serde_json::to_string(&visit).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    #[zbus(property)]
    async fn unique_visitors(&self) -> u64 {
        lock_status(&self.status).unique_visitors
    }

    /// Emitted once per recorded visit with the visit as JSON.
    #[zbus(signal)]
    pub async fn visit_recorded(emitter: &SignalEmitter<'_>, visit: &str) -> zbus::Result<()>;
}
