// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Wire formats spoken by qsocks peers
//!
//! - [socks5]: inbound destination discovery from local clients
//! - [http_tunnel]: the `POST` handshake understood by tunnel gateways
//! - [header]: the destination frame opening every leased multiplexed stream

use std::net::IpAddr;

pub mod header;
pub mod http_tunnel;
pub mod socks5;

/// A `host:port` pair naming where a client wants its bytes to go
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Destination {
  pub host: String,
  pub port: u16,
}

impl Destination {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }
}

impl std::fmt::Display for Destination {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.host.parse::<IpAddr>() {
      Ok(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
      _ => write!(f, "{}:{}", self.host, self.port),
    }
  }
}

impl From<std::net::SocketAddr> for Destination {
  fn from(addr: std::net::SocketAddr) -> Self {
    Self::new(addr.ip().to_string(), addr.port())
  }
}
