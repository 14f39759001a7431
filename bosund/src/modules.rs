//! Module registry and lifecycle fan-out.
//!
//! Modules are initialized in configuration order. A module that has
//! nothing to do (no matching configuration) reports itself inactive
//! and is skipped for the rest of the daemon's life. Lifecycle events
//! go to active modules one at a time, in registration order, and a
//! failing handler never stops the fan-out.

use crate::instance::{Instance, ServiceRun};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

#[derive(Clone)]
pub enum LifecycleEvent {
    /// A service finished its startup wiring.
    Start(Arc<ServiceRun>),
    /// Time to refresh and publish stats for the given scope.
    Stats(StatsScope),
}

#[derive(Clone)]
pub enum StatsScope {
    Host,
    Service(Arc<ServiceRun>),
}

#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wires the module up against the instance. `Ok(false)` means the
    /// configuration gives this module nothing to do.
    async fn init(self: Arc<Self>, instance: &Arc<Instance>) -> Result<bool>;

    /// Lifecycle capability; captured once when the module activates.
    fn lifecycle(self: Arc<Self>) -> Option<Arc<dyn LifecycleHandler>> {
        None
    }
}

#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    async fn on_event(&self, event: &LifecycleEvent) -> Result<()>;
}

struct ActiveModule {
    name: &'static str,
    lifecycle: Option<Arc<dyn LifecycleHandler>>,
}

pub struct ModuleRuntime {
    active: RwLock<Vec<ActiveModule>>,
}

impl ModuleRuntime {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Vec::new()),
        }
    }

    /// Initializes modules in order. Failures are logged and isolate
    /// the failing module; the daemon keeps running without it.
    pub async fn load(&self, instance: &Arc<Instance>, modules: Vec<Arc<dyn Module>>) {
        for module in modules {
            let name = module.name();
            match module.clone().init(instance).await {
                Ok(true) => {
                    let lifecycle = module.lifecycle();
                    debug!(module = name, "module active");
                    self.active
                        .write()
                        .await
                        .push(ActiveModule { name, lifecycle });
                }
                Ok(false) => debug!(module = name, "module inactive"),
                Err(err) => error!(module = name, "module failed to initialize: {err:#}"),
            }
        }
    }

    pub async fn emit(&self, event: &LifecycleEvent) {
        let handlers: Vec<(&'static str, Arc<dyn LifecycleHandler>)> = {
            self.active
                .read()
                .await
                .iter()
                .filter_map(|module| {
                    module
                        .lifecycle
                        .clone()
                        .map(|handler| (module.name, handler))
                })
                .collect()
        };
        for (name, handler) in handlers {
            if let Err(err) = handler.on_event(event).await {
                error!(module = name, "lifecycle handler failed: {err:#}");
            }
        }
    }

    pub async fn active_names(&self) -> Vec<&'static str> {
        self.active
            .read()
            .await
            .iter()
            .map(|module| module.name)
            .collect()
    }
}

impl Default for ModuleRuntime {
    fn default() -> Self {
        Self::new()
    }
}
