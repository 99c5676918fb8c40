// Route module
//
// - types: Route, Endpoint, Protocol and the unvalidated RouteDefinition
// - table: RouteTable, the in-memory registry of declared routes

pub mod table;
pub mod types;

pub use table::RouteTable;
pub use types::{Endpoint, Protocol, Route, RouteDefinition, RouteStatus};
