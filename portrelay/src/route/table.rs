use crate::error::{RelayError, RelayResult};
use crate::route::types::Route;
use log::{info, warn};

/// In-memory registry of route definitions, kept in insertion order.
///
/// Pure data: no I/O and no knowledge of running listeners. Port collisions are not
/// checked here since two disabled routes may harmlessly share an address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a loaded route list. Later duplicates of a name are dropped.
    pub fn from_routes(routes: Vec<Route>) -> Self {
        let mut table = Self::new();
        for route in routes {
            let name = route.get_name().to_string();
            if table.add(route).is_err() {
                warn!("Ignoring duplicate route definition: {}", name);
            }
        }
        table
    }

    pub fn add(&mut self, route: Route) -> RelayResult<()> {
        if self.get(route.get_name()).is_some() {
            return Err(RelayError::DuplicateName(route.get_name().to_string()));
        }
        info!("Adding route: {}", route);
        self.routes.push(route);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> RelayResult<Route> {
        let index = self.index_of(name)?;
        info!("Removing route: {}", name);
        Ok(self.routes.remove(index))
    }

    /// Replace every field of the route keyed by `name`. The replacement's own name is ignored.
    pub fn update(&mut self, name: &str, mut replacement: Route) -> RelayResult<Route> {
        let index = self.index_of(name)?;
        replacement.name = self.routes[index].name.clone();
        info!("Updating route: {}", replacement);
        Ok(std::mem::replace(&mut self.routes[index], replacement))
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> RelayResult<&Route> {
        let index = self.index_of(name)?;
        let route = &mut self.routes[index];
        route.enabled = enabled;
        info!("Route {} is now {}", name, if enabled { "enabled" } else { "disabled" });
        Ok(route)
    }

    pub fn get(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.get_name() == name)
    }

    pub fn list(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn index_of(&self, name: &str) -> RelayResult<usize> {
        self.routes.iter().position(|r| r.get_name() == name).ok_or_else(|| RelayError::NotFound(name.to_string()))
    }
}
