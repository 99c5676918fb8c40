// Configuration module
//
// This module contains all configuration-related functionality split into focused submodules:
// - types: Core configuration structures and types
// - loader: Configuration file loading and saving
// - store: Route persistence (the RouteStore collaborator and its implementations)
// - watcher: File watching functionality

pub mod loader;
pub mod store;
pub mod types;
pub mod watcher;

pub use store::{ConfigStore, MemoryStore, RouteStore};
pub use types::{Config, ControlConfig, LoggingConfig};
