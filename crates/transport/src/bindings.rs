use std::net::TcpListener;

use crate::TransportError;

/// Ask the OS for a currently unused loopback port
pub fn get_random_tcp_port() -> Result<u16, TransportError> {
    let mut last_error = None;
    for _ in 0..50 {
        match TcpListener::bind("127.0.0.1:0").and_then(|listener| listener.local_addr()) {
            Ok(addr) => return Ok(addr.port()),
            Err(e) => {
                tracing::warn!(%e, "binding");
                last_error = Some(e);
            }
        }
    }

    Err(TransportError::Connect {
        address: "127.0.0.1:0".to_string(),
        reason: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "could not get free port".to_string()),
    })
}
