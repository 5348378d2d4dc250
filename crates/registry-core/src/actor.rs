//! Best-effort actor metadata recorded with each audit entry.

use serde::{Deserialize, Serialize};
use std::net::UdpSocket;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorInfo {
    pub user: String,
    pub host: Option<String>,
    pub ip: Option<String>,
}

impl ActorInfo {
    /// Gather user, host and outbound address. Never fails; missing pieces stay `None`.
    pub fn current() -> Self {
        Self {
            user: current_user(),
            host: current_host(),
            ip: local_ip(),
        }
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn current_host() -> Option<String> {
    let from_env = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty());
    if from_env.is_some() {
        return from_env;
    }
    match std::fs::read_to_string("/etc/hostname") {
        Ok(name) if !name.trim().is_empty() => Some(name.trim().to_string()),
        Ok(_) => None,
        Err(e) => {
            warn!("hostname unavailable for audit metadata: {}", e);
            None
        }
    }
}

// connect() on UDP only selects a route; nothing is sent.
fn local_ip() -> Option<String> {
    let route = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("192.0.2.1:9")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    match route() {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!("local address unavailable for audit metadata: {}", e);
            None
        }
    }
}
