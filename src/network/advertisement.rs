use std::net::SocketAddr;

use crate::config::IntakeConfig;

/// Presence announcement broadcast by the intake point
///
/// The payload is deliberately not a valid sensor message, so when it loops back
/// to the intake socket it is classified as foreign traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    payload: Vec<u8>,
    destination: SocketAddr,
}

impl Advertisement {
    pub fn new(message: &str, destination: SocketAddr) -> Self {
        Self {
            payload: message.as_bytes().to_vec(),
            destination,
        }
    }

    pub fn from_config(config: &IntakeConfig) -> Self {
        Self::new(
            &config.advertisement_message,
            config.broadcast_socket_addr(),
        )
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}
