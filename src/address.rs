//! Destination address parsing.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::lookup_host;

use crate::error::{QueryError, Result};

/// Parse a destination into a socket address.
///
/// Accepts `a.b.c.d:port`, a bare IPv4 literal, `host:port`, or a bare host.
/// Inputs without a port use `default_port`. Host names are resolved and the
/// first IPv4 result is preferred.
pub async fn parse_address(input: &str, default_port: u16) -> Result<SocketAddr> {
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid_input("empty address"));
    }

    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let (host, port) = split_host_port(input, default_port)?;
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::new(IpAddr::V4(ip), port));
    }

    let resolved: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    resolved
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| invalid_input(format!("no addresses for '{host}'")))
}

fn split_host_port(input: &str, default_port: u16) -> Result<(&str, u16)> {
    match input.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid_input(format!("invalid port in '{input}'")))?;
            if host.is_empty() {
                return Err(invalid_input(format!("missing host in '{input}'")));
            }
            Ok((host, port))
        }
        _ => Ok((input, default_port)),
    }
}

fn invalid_input(msg: impl Into<String>) -> QueryError {
    QueryError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ipv4_with_port() {
        let addr = parse_address("10.0.0.5:27015", 1).await.unwrap();
        assert_eq!(addr, "10.0.0.5:27015".parse().unwrap());
    }

    #[tokio::test]
    async fn test_bare_ipv4_uses_default_port() {
        let addr = parse_address("192.168.1.2", 27015).await.unwrap();
        assert_eq!(addr, "192.168.1.2:27015".parse().unwrap());
    }

    #[tokio::test]
    async fn test_hostname_resolves() {
        let addr = parse_address("localhost:7777", 1).await.unwrap();
        assert_eq!(addr.port(), 7777);
        assert!(addr.ip().is_loopback());

        let bare = parse_address("localhost", 25565).await.unwrap();
        assert_eq!(bare.port(), 25565);
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        assert!(parse_address("", 1).await.is_err());
        assert!(parse_address("host:notaport", 1).await.is_err());
        assert!(parse_address(":80", 1).await.is_err());
    }
}
