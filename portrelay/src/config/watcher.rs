use crate::config::types::Config;
use crate::orchestrator::LifecycleOrchestrator;
use log::{debug, info, trace, warn};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

impl Config {
    /// Watch the config file and reload the orchestrator when its routes change.
    ///
    /// Writes that leave the route list unchanged (including the engine's own saves)
    /// are ignored. Returns the watcher, which stops watching when dropped.
    pub fn watch_config_file(&self, orchestrator: Arc<LifecycleOrchestrator>) -> anyhow::Result<RecommendedWatcher> {
        let path = self.path.clone();
        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(16);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;
        // The parent directory is watched so editors that replace the file are still seen.
        let watched = path.parent().filter(|p| !p.as_os_str().is_empty()).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&watched, RecursiveMode::NonRecursive)?;
        info!("Watching {} for route changes", path.display());

        tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Failed to receive config file event: {:?}", e);
                        continue;
                    }
                };
                if !event.paths.iter().any(|p| p.file_name() == path.file_name()) {
                    continue;
                }
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    trace!("Config file event: {:?}", event);
                    continue; // ignore other events
                }
                debug!("Config file changed: {:?}", event.kind);
                reload_if_changed(&path, &orchestrator).await;
            }
        });
        Ok(watcher)
    }
}

async fn reload_if_changed(path: &Path, orchestrator: &LifecycleOrchestrator) {
    let routes = match Config::read(path).await {
        Ok(Some(config)) => config.routes,
        Ok(None) => {
            debug!("Config file removed, keeping the current routes");
            return;
        }
        Err(e) => {
            // Usually a partially written file; the next modify event retries.
            warn!("Failed to reload config: {}", e);
            return;
        }
    };
    if routes == orchestrator.get_routes().await {
        trace!("Config file changed without route changes");
        return;
    }
    info!("Routes changed on disk, reloading");
    let message = orchestrator.reload(routes).await;
    info!("{}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::route::{Endpoint, Protocol, Route};
    use std::time::Duration;

    #[tokio::test]
    async fn test_route_edits_on_disk_are_applied() {
        let dir = std::env::temp_dir().join(format!("portrelay-watch-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("portrelay.json");
        let config = Config::try_load(&path).await.unwrap();

        let store = Arc::new(ConfigStore::new(config.clone()));
        let orchestrator = Arc::new(LifecycleOrchestrator::new(config.session_idle_timeout(), store));
        orchestrator.bootstrap().await;
        let _watcher = config.watch_config_file(orchestrator.clone()).unwrap();

        let mut edited = config.clone();
        edited.set_routes(vec![Route::new("late", Protocol::Udp, Endpoint::new("127.0.0.1", 1), Endpoint::new("127.0.0.1", 2), false).unwrap()]);
        edited.save().await.unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if orchestrator.get_route("late").await.is_some() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(seen);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
