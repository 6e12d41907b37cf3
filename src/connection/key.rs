//! Pool keys and keying strategies.

use std::fmt;
use std::net::SocketAddr;

/// Identifies which connections are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    address: Option<SocketAddr>,
    message_type: Option<&'static str>,
}

impl PoolKey {
    /// Key by destination and message type.
    pub fn new(address: Option<SocketAddr>, message_type: Option<&'static str>) -> Self {
        Self {
            address,
            message_type,
        }
    }

    /// Key by destination only.
    pub fn for_address(address: SocketAddr) -> Self {
        Self::new(Some(address), None)
    }

    /// Key by message type only, for address-agnostic transports.
    pub fn for_message_type(message_type: &'static str) -> Self {
        Self::new(None, Some(message_type))
    }

    /// Destination address, if part of the key.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Message type, if part of the key.
    pub fn message_type(&self) -> Option<&'static str> {
        self.message_type
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.address, self.message_type) {
            (Some(addr), Some(ty)) => write!(f, "{ty}@{addr}"),
            (Some(addr), None) => write!(f, "{addr}"),
            (None, Some(ty)) => write!(f, "{ty}"),
            (None, None) => f.write_str("*"),
        }
    }
}

/// How envelopes are mapped onto pool keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyStrategy {
    /// One set of connections per destination.
    #[default]
    ByAddress,
    /// One set of connections per message type, shared across destinations.
    ByMessageType,
    /// One set of connections per destination and message type.
    ByAddressAndType,
}

impl KeyStrategy {
    /// Build the key for a request.
    pub fn key_for(&self, address: Option<SocketAddr>, message_type: &'static str) -> PoolKey {
        match self {
            KeyStrategy::ByAddress => PoolKey::new(address, None),
            KeyStrategy::ByMessageType => PoolKey::for_message_type(message_type),
            KeyStrategy::ByAddressAndType => PoolKey::new(address, Some(message_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_strategies() {
        let addr: SocketAddr = "10.0.0.1:27015".parse().unwrap();

        let by_addr = KeyStrategy::ByAddress.key_for(Some(addr), "info");
        assert_eq!(by_addr, PoolKey::for_address(addr));

        let by_type = KeyStrategy::ByMessageType.key_for(Some(addr), "info");
        assert_eq!(by_type.address(), None);
        assert_eq!(by_type.message_type(), Some("info"));

        let both = KeyStrategy::ByAddressAndType.key_for(Some(addr), "info");
        assert_eq!(both.to_string(), "info@10.0.0.1:27015");
    }
}
