// Listener module
//
// - registry: ListenerRegistry, the synchronized set of running listeners
// - tcp: accept loop dispatching connections to ConnectionRelay
// - udp: receive loop dispatching datagrams to the route's SessionTable

pub mod registry;
mod tcp;
mod udp;

pub use registry::{ActiveSummary, ListenerRegistry};

use std::io::{Error, ErrorKind};

/// Errors that mean the listening socket itself is unusable. Anything else, including
/// running out of file descriptors or buffer space, concerns a single connection or
/// datagram and is retried after a back-off.
pub(crate) fn is_fatal(error: &Error) -> bool {
    matches!(error.kind(), ErrorKind::InvalidInput | ErrorKind::NotConnected | ErrorKind::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_connection_errors_are_not_fatal() {
        assert!(!is_fatal(&Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_fatal(&Error::from(ErrorKind::ConnectionAborted)));
        assert!(!is_fatal(&Error::from(ErrorKind::TimedOut)));
        assert!(!is_fatal(&Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_fatal(&Error::from(ErrorKind::OutOfMemory)));
        assert!(!is_fatal(&Error::other("temporary failure")));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_resource_exhaustion_is_not_fatal() {
        // EMFILE, ENFILE, ENOBUFS, ENOMEM
        for code in [24, 23, 105, 12] {
            assert!(!is_fatal(&Error::from_raw_os_error(code)), "os error {} ended the listener", code);
        }
    }

    #[test]
    fn test_broken_socket_is_fatal() {
        assert!(is_fatal(&Error::from(ErrorKind::InvalidInput)));
        assert!(is_fatal(&Error::from(ErrorKind::NotConnected)));
        assert!(is_fatal(&Error::from(ErrorKind::Unsupported)));
    }
}
