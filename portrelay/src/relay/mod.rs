// Relay module
//
// - connection: byte pipe between an accepted tcp client and its backend
// - session: per-client session table for udp routes, with idle eviction

pub mod connection;
pub mod session;

pub use connection::ConnectionRelay;
pub use session::SessionTable;
