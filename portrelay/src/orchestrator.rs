//! Keeps the set of running listeners in step with the route table.
//!
//! Every operation takes the table lock for its whole duration, so control operations,
//! restarts and reloads are applied one at a time. A route is never reconfigured in
//! place: a running listener is always stopped before its replacement is started.

use crate::config::RouteStore;
use crate::error::{RelayError, RelayResult};
use crate::listener::{ActiveSummary, ListenerRegistry};
use crate::route::{Route, RouteDefinition, RouteStatus, RouteTable};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct LifecycleOrchestrator {
    table: Mutex<RouteTable>,
    registry: ListenerRegistry,
    store: Arc<dyn RouteStore>,
}

impl LifecycleOrchestrator {
    pub fn new(idle_timeout: Duration, store: Arc<dyn RouteStore>) -> Self {
        Self { table: Mutex::new(RouteTable::new()), registry: ListenerRegistry::new(idle_timeout), store }
    }

    pub fn get_registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Load the persisted table. When nothing is persisted yet an empty table is written;
    /// a store that cannot be read leaves the file untouched and starts empty.
    pub async fn bootstrap(&self) -> usize {
        let mut table = self.table.lock().await;
        let store = self.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load()).await.map_err(anyhow::Error::from).and_then(|loaded| loaded);
        match loaded {
            Ok(Some(routes)) => {
                *table = RouteTable::from_routes(routes);
                info!("Loaded {} route(s)", table.len());
            }
            Ok(None) => {
                info!("No persisted routes found, starting with an empty route table");
                *table = RouteTable::new();
                self.persist(&table).await;
            }
            Err(e) => {
                error!("Failed to load persisted routes, starting with an empty route table: {}", e);
                *table = RouteTable::new();
            }
        }
        table.len()
    }

    /// Stop everything, then start every enabled route in table order.
    /// Returns how many listeners came up.
    pub async fn start_all(&self) -> usize {
        let table = self.table.lock().await;
        self.registry.stop_all().await;
        self.start_enabled(&table).await
    }

    /// Stop every listener. The route table is left as is.
    pub async fn stop_all(&self) -> usize {
        let _table = self.table.lock().await;
        let stopped = self.registry.stop_all().await;
        info!("Stopped {} listener(s)", stopped);
        stopped
    }

    /// Full stop followed by a fresh start. Routes that fail to start are only logged.
    pub async fn restart(&self) -> String {
        let table = self.table.lock().await;
        let stopped = self.registry.stop_all().await;
        let started = self.start_enabled(&table).await;
        let enabled = table.list().iter().filter(|r| r.is_enabled()).count();
        info!("Restarted: {} listener(s) stopped, {}/{} enabled route(s) started", stopped, started, enabled);
        format!("Restarted {} of {} enabled route(s)", started, enabled)
    }

    /// Replace the whole table (e.g. after the config file changed) and restart.
    pub async fn reload(&self, routes: Vec<Route>) -> String {
        {
            let mut table = self.table.lock().await;
            *table = RouteTable::from_routes(routes);
            info!("Route table reloaded with {} route(s)", table.len());
        }
        self.restart().await
    }

    pub async fn add_route(&self, definition: RouteDefinition) -> RelayResult<String> {
        let route = Route::try_from(definition)?;
        let mut table = self.table.lock().await;
        table.add(route.clone())?;
        self.persist(&table).await;

        let mut message = format!("Route '{}' added", route.get_name());
        if let Some(note) = self.reconcile(route.get_name(), Some(&route)).await {
            message.push_str(&note);
        }
        Ok(message)
    }

    pub async fn remove_route(&self, name: &str) -> RelayResult<String> {
        let mut table = self.table.lock().await;
        table.remove(name)?;
        self.persist(&table).await;
        self.reconcile(name, None).await;
        Ok(format!("Route '{}' removed", name))
    }

    /// Replace every field except the name. A disabled route is updated without starting anything.
    pub async fn update_route(&self, name: &str, definition: RouteDefinition) -> RelayResult<String> {
        let mut table = self.table.lock().await;
        if table.get(name).is_none() {
            return Err(RelayError::NotFound(name.to_string()));
        }
        let route = Route::from_definition(definition, Some(name))?;
        let previous = table.update(name, route.clone())?;
        debug!("Route {} replaced {}", route, previous);
        self.persist(&table).await;

        let mut message = format!("Route '{}' updated", name);
        if let Some(note) = self.reconcile(name, Some(&route)).await {
            message.push_str(&note);
        }
        Ok(message)
    }

    pub async fn toggle_route(&self, name: &str) -> RelayResult<String> {
        let mut table = self.table.lock().await;
        let enabled = table.get(name).map(|r| !r.is_enabled()).ok_or_else(|| RelayError::NotFound(name.to_string()))?;
        self.apply_enabled(&mut table, name, enabled).await
    }

    pub async fn set_route_enabled(&self, name: &str, enabled: bool) -> RelayResult<String> {
        let mut table = self.table.lock().await;
        self.apply_enabled(&mut table, name, enabled).await
    }

    pub async fn list_routes(&self) -> Vec<RouteStatus> {
        let table = self.table.lock().await;
        let mut statuses = Vec::with_capacity(table.len());
        for route in table.list() {
            let active = self.registry.is_active(route.get_name()).await;
            statuses.push(RouteStatus { route: route.clone().into(), active });
        }
        statuses
    }

    pub async fn get_route(&self, name: &str) -> Option<RouteStatus> {
        let table = self.table.lock().await;
        let route = table.get(name)?.clone();
        let active = self.registry.is_active(name).await;
        Some(RouteStatus { route: route.into(), active })
    }

    /// Snapshot of the declared routes, in table order.
    pub async fn get_routes(&self) -> Vec<Route> {
        self.table.lock().await.list().to_vec()
    }

    pub async fn list_active(&self) -> Vec<ActiveSummary> {
        self.registry.list_active().await
    }

    async fn apply_enabled(&self, table: &mut RouteTable, name: &str, enabled: bool) -> RelayResult<String> {
        let route = table.set_enabled(name, enabled)?.clone();
        let state = if enabled { "enabled" } else { "disabled" };
        self.persist(table).await;

        let mut message = format!("Route '{}' {}", name, state);
        if let Some(note) = self.reconcile(name, Some(&route)).await {
            message.push_str(&note);
        }
        Ok(message)
    }

    // Stop the listener running under `name`, then start `desired` if it should run.
    // Returns a note for the caller when the start failed.
    async fn reconcile(&self, name: &str, desired: Option<&Route>) -> Option<String> {
        self.registry.stop_route(name).await;
        let route = desired.filter(|r| r.is_enabled())?;
        match self.registry.start_route(route).await {
            Ok(_) => None,
            Err(e) => {
                error!("[{}] Listener not started: {}", name, e);
                Some(format!(", but its listener failed to start: {}", e))
            }
        }
    }

    async fn start_enabled(&self, table: &RouteTable) -> usize {
        let mut started = 0;
        for route in table.list().iter().filter(|r| r.is_enabled()) {
            match self.registry.start_route(route).await {
                Ok(_) => started += 1,
                Err(e) => error!("[{}] Skipping route: {}", route.get_name(), e),
            }
        }
        started
    }

    /// Write the table through the store on the blocking pool. Awaited under the table lock,
    /// so saves land in the order the changes were made.
    async fn persist(&self, table: &RouteTable) {
        let store = self.store.clone();
        let routes = table.list().to_vec();
        let saved = tokio::task::spawn_blocking(move || store.save(&routes)).await.map_err(anyhow::Error::from).and_then(|saved| saved);
        if let Err(e) = saved {
            let e = RelayError::Persistence(e.to_string());
            warn!("{}; the change is kept in memory only", e);
        }
    }
}
