use crate::config::types::Config;
use crate::route::Route;
use anyhow::Result;
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistence collaborator for the route table.
///
/// Saves are best-effort: callers log failures and never roll back in-memory state.
pub trait RouteStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<Vec<Route>>>;

    fn save(&self, routes: &[Route]) -> Result<()>;
}

/// Persists routes into the `routes` array of the JSON config file, keeping the other settings.
pub struct ConfigStore {
    config: Mutex<Config>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self { config: Mutex::new(config) }
    }

    pub fn path(&self) -> PathBuf {
        self.lock().get_path().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        // A poisoned lock only means a previous save panicked; the config itself is still usable.
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RouteStore for ConfigStore {
    fn load(&self) -> Result<Option<Vec<Route>>> {
        let path = self.path();
        debug!("Reading routes from: {}", path.display());
        let Some(loaded) = read_settings(&path)? else { return Ok(None) };
        let routes = loaded.routes.clone();
        *self.lock() = loaded;
        Ok(Some(routes))
    }

    fn save(&self, routes: &[Route]) -> Result<()> {
        let mut config = self.lock();
        // Pick up settings edited on disk since the last load so they are not overwritten.
        if let Ok(Some(on_disk)) = read_settings(config.get_path()) {
            *config = on_disk;
        }
        config.set_routes(routes.to_vec());
        config.save_blocking()
    }
}

fn read_settings(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let mut config = serde_json::from_str::<Config>(&content)?;
    config.path = path.to_path_buf();
    Ok(Some(config))
}

/// Keeps routes in memory only. `set_failing(true)` makes every save fail.
#[derive(Default)]
pub struct MemoryStore {
    routes: Mutex<Option<Vec<Route>>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new(routes: Option<Vec<Route>>) -> Self {
        Self { routes: Mutex::new(routes), failing: Default::default() }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Option<Vec<Route>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl RouteStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<Route>>> {
        Ok(self.snapshot())
    }

    fn save(&self, routes: &[Route]) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Route store is unavailable"));
        }
        *self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(routes.to_vec());
        Ok(())
    }
}
