/**
 * LOCAL MANAGEMENT BUS - in-process delivery of statistics
 *
 * ROLE:
 * A local bus has no broker behind it. Its worker hands every wire message
 * to a LocalMgmtBusListener running inside the pump process.
 *
 * HOW IT WORKS:
 * - listeners are created from a compile-time registry: key -> constructor
 * - configuration names the key plus free-form string options
 * - an unknown key is a configuration error at startup
 */

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PumpError, Result};
use crate::message::WireMessage;

pub trait LocalMgmtBusListener: Send + Sync {
    /// Called once before the first poll; an error aborts startup.
    fn on_pump_startup(&self) -> Result<()> {
        Ok(())
    }

    fn on_mgmt_bus_stats(&self, message: &WireMessage);

    fn on_pump_shutdown(&self) {}
}

pub type ListenerOptions = BTreeMap<String, String>;

type ListenerCtor = Box<dyn Fn(&ListenerOptions) -> Result<Arc<dyn LocalMgmtBusListener>> + Send + Sync>;

pub struct ListenerRegistry {
    constructors: BTreeMap<String, ListenerCtor>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ListenerRegistry {
    pub fn empty() -> Self {
        Self { constructors: BTreeMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("logging", |options| {
            let level = options.get("level").map(String::as_str).unwrap_or("info");
            Ok(Arc::new(LoggingListener::new(level == "debug")) as Arc<dyn LocalMgmtBusListener>)
        });
        registry
    }

    pub fn register<F>(&mut self, key: &str, ctor: F)
    where
        F: Fn(&ListenerOptions) -> Result<Arc<dyn LocalMgmtBusListener>> + Send + Sync + 'static,
    {
        if self.constructors.insert(key.to_string(), Box::new(ctor)).is_some() {
            warn!("Local bus listener {} registered twice, keeping the last one", key);
        }
    }

    /// Registers a ready-made instance under `key`.
    pub fn register_instance(&mut self, key: &str, listener: Arc<dyn LocalMgmtBusListener>) {
        self.register(key, move |_| Ok(listener.clone()));
    }

    pub fn create(&self, key: &str, options: &ListenerOptions) -> Result<Arc<dyn LocalMgmtBusListener>> {
        let ctor = self.constructors.get(key).ok_or_else(|| PumpError::UnknownListener(key.to_string()))?;
        debug!("Creating local bus listener {}", key);
        ctor(options)
    }

    pub fn keys(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }
}

/// Logs a one-line summary of every message it receives.
pub struct LoggingListener {
    verbose: bool,
}

impl LoggingListener {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl LocalMgmtBusListener for LoggingListener {
    fn on_pump_startup(&self) -> Result<()> {
        info!("Logging listener attached");
        Ok(())
    }

    fn on_mgmt_bus_stats(&self, message: &WireMessage) {
        if self.verbose {
            debug!("{} [{}] {}", message.topic, message.encoding.key(), String::from_utf8_lossy(&message.payload));
        } else {
            info!("{} [{}] {} bytes", message.topic, message.encoding.key(), message.payload.len());
        }
    }

    fn on_pump_shutdown(&self) {
        info!("Logging listener detached");
    }
}

/// Keeps every message in memory; handy for embedding and tests.
#[derive(Default)]
pub struct CollectingListener {
    messages: Mutex<Vec<WireMessage>>,
    started: Mutex<bool>,
    stopped: Mutex<bool>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<WireMessage> {
        self.messages.lock().clone()
    }

    pub fn started(&self) -> bool {
        *self.started.lock()
    }

    pub fn stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

impl LocalMgmtBusListener for CollectingListener {
    fn on_pump_startup(&self) -> Result<()> {
        *self.started.lock() = true;
        Ok(())
    }

    fn on_mgmt_bus_stats(&self, message: &WireMessage) {
        self.messages.lock().push(message.clone());
    }

    fn on_pump_shutdown(&self) {
        *self.stopped.lock() = true;
    }
}
