use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;

use crate::broadcast::Fanout;
use crate::lifecycle::TimerRegistry;

/// Shared application state. Everything here is lifecycle-scoped: built once
/// in `main`, cloned into handlers and timer tasks, dropped on shutdown.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub fanout: Arc<Fanout>,
    pub timers: Arc<TimerRegistry>,
    pub locks: Arc<LockMap>,
}

impl AppState {
    pub fn new(db: SqlitePool) -> Self {
        AppState {
            db,
            fanout: Arc::new(Fanout::new()),
            timers: Arc::new(TimerRegistry::new()),
            locks: Arc::new(LockMap::new()),
        }
    }
}

/// Named async mutexes, created on first use. Queue mutations serialize on
/// the business key; booking conflict checks serialize on the employee key.
pub struct LockMap {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        LockMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: String) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("lock map poisoned");
        map.entry(key).or_default().clone()
    }

    pub fn business(&self, business_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.get(format!("business:{business_id}"))
    }

    pub fn employee(&self, employee_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.get(format!("employee:{employee_id}"))
    }
}

impl Default for LockMap {
    fn default() -> Self {
        Self::new()
    }
}
