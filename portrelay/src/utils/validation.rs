//! Common validation utilities shared across modules

use std::net::IpAddr;

/// Validate that a port number is in valid range (1-65535)
pub fn validate_port_range(port: u16) -> Result<(), String> {
    if port == 0 {
        return Err("Port must be between 1 and 65535".to_string());
    }
    Ok(())
}

/// Check if a string is empty or only whitespace
pub fn is_empty_or_whitespace(s: &str) -> bool {
    s.trim().is_empty()
}

/// Validate that a hostname doesn't contain invalid characters
pub fn validate_hostname_chars(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && !hostname.starts_with('-')
        && !hostname.ends_with('-')
}

/// Validate a host as either an IP literal (v4 or v6, brackets allowed) or a DNS name
pub fn validate_host(host: &str) -> Result<(), String> {
    if is_empty_or_whitespace(host) {
        return Err("Host must not be empty".to_string());
    }
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if literal.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if !validate_hostname_chars(host) {
        return Err(format!("Invalid host: {}", host));
    }
    Ok(())
}
