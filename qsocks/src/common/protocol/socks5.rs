// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Server side of the SOCKS5 handshake (RFC 1928), limited to `CONNECT` without authentication

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Destination;
use crate::common::BrokerError;

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTHENTICATION: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
pub const COMMAND_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
  Succeeded = 0x00,
  GeneralFailure = 0x01,
  HostUnreachable = 0x04,
  CommandNotSupported = 0x07,
  AddressTypeNotSupported = 0x08,
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("unsupported SOCKS version {0:#04x}")]
  UnsupportedVersion(u8),
  #[error("client offered no acceptable authentication method")]
  NoAcceptableMethod,
  #[error("unsupported SOCKS command {0:#04x}")]
  UnsupportedCommand(u8),
  #[error("unsupported SOCKS address type {0:#04x}")]
  UnsupportedAddressType(u8),
  #[error(transparent)]
  Broker(#[from] BrokerError),
}

impl From<std::io::Error> for HandshakeError {
  fn from(error: std::io::Error) -> Self {
    Self::Broker(error.into())
  }
}

impl HandshakeError {
  /// The reply owed to the client before closing, if the failure happened at the request stage
  pub fn reply(&self) -> Option<Reply> {
    match self {
      Self::UnsupportedCommand(_) => Some(Reply::CommandNotSupported),
      Self::UnsupportedAddressType(_) => Some(Reply::AddressTypeNotSupported),
      _ => None,
    }
  }
}

impl From<HandshakeError> for BrokerError {
  fn from(error: HandshakeError) -> Self {
    match error {
      HandshakeError::Broker(inner) => inner,
      other => BrokerError::Unsupported(other.to_string()),
    }
  }
}

/// Reads the client greeting and selects "no authentication"
pub async fn negotiate_method<S>(stream: &mut S) -> Result<(), HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let version = stream.read_u8().await?;
  if version != SOCKS_VERSION {
    return Err(HandshakeError::UnsupportedVersion(version));
  }
  let method_count = stream.read_u8().await? as usize;
  let mut methods = vec![0u8; method_count];
  stream.read_exact(&mut methods).await?;
  if !methods.contains(&METHOD_NO_AUTHENTICATION) {
    stream
      .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
      .await?;
    stream.flush().await?;
    return Err(HandshakeError::NoAcceptableMethod);
  }
  stream
    .write_all(&[SOCKS_VERSION, METHOD_NO_AUTHENTICATION])
    .await?;
  stream.flush().await?;
  Ok(())
}

/// Reads a `CONNECT` request and returns its destination
///
/// Other commands and unknown address types are reported as errors carrying the [Reply] to send.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Destination, HandshakeError> {
  let mut head = [0u8; 4];
  r.read_exact(&mut head).await?;
  let [version, command, _reserved, address_type] = head;
  if version != SOCKS_VERSION {
    return Err(HandshakeError::UnsupportedVersion(version));
  }
  if command != COMMAND_CONNECT {
    return Err(HandshakeError::UnsupportedCommand(command));
  }
  let host = match address_type {
    ATYP_IPV4 => {
      let mut octets = [0u8; 4];
      r.read_exact(&mut octets).await?;
      Ipv4Addr::from(octets).to_string()
    }
    ATYP_IPV6 => {
      let mut octets = [0u8; 16];
      r.read_exact(&mut octets).await?;
      Ipv6Addr::from(octets).to_string()
    }
    ATYP_DOMAIN => {
      let len = r.read_u8().await? as usize;
      let mut domain = vec![0u8; len];
      r.read_exact(&mut domain).await?;
      String::from_utf8(domain)
        .map_err(|_| BrokerError::protocol("SOCKS domain name is not valid UTF-8"))?
    }
    other => return Err(HandshakeError::UnsupportedAddressType(other)),
  };
  let port = r.read_u16().await?;
  Ok(Destination::new(host, port))
}

pub fn encode_reply(reply: Reply, bound: Option<SocketAddr>) -> Vec<u8> {
  let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
  let mut frame = Vec::with_capacity(22);
  frame.extend_from_slice(&[SOCKS_VERSION, reply as u8, 0x00]);
  match bound.ip() {
    IpAddr::V4(v4) => {
      frame.push(ATYP_IPV4);
      frame.extend_from_slice(&v4.octets());
    }
    IpAddr::V6(v6) => {
      frame.push(ATYP_IPV6);
      frame.extend_from_slice(&v6.octets());
    }
  }
  frame.extend_from_slice(&bound.port().to_be_bytes());
  frame
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
  w: &mut W,
  reply: Reply,
  bound: Option<SocketAddr>,
) -> Result<(), BrokerError> {
  w.write_all(&encode_reply(reply, bound)).await?;
  w.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::net::SocketAddr;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{encode_reply, negotiate_method, read_request, HandshakeError, Reply};
  use crate::common::protocol::Destination;

  #[tokio::test]
  async fn greeting_selects_no_authentication() {
    let (mut server, mut client) = tokio::io::duplex(64);
    client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();
    negotiate_method(&mut server).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
  }

  #[tokio::test]
  async fn greeting_without_no_auth_is_refused() {
    let (mut server, mut client) = tokio::io::duplex(64);
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    assert!(matches!(
      negotiate_method(&mut server).await,
      Err(HandshakeError::NoAcceptableMethod)
    ));
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);
  }

  #[tokio::test]
  async fn requests_parse_every_address_type() {
    let mut ipv4: &[u8] = &[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x23, 0x29];
    assert_eq!(
      read_request(&mut ipv4).await.unwrap(),
      Destination::new("127.0.0.1", 9001)
    );

    let mut domain = vec![0x05, 0x01, 0x00, 0x03, 11];
    domain.extend_from_slice(b"example.com");
    domain.extend_from_slice(&443u16.to_be_bytes());
    assert_eq!(
      read_request(&mut domain.as_slice()).await.unwrap(),
      Destination::new("example.com", 443)
    );

    let mut ipv6 = vec![0x05, 0x01, 0x00, 0x04];
    ipv6.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
    ipv6.extend_from_slice(&80u16.to_be_bytes());
    assert_eq!(
      read_request(&mut ipv6.as_slice()).await.unwrap(),
      Destination::new("::1", 80)
    );
  }

  #[tokio::test]
  async fn unsupported_requests_name_their_reply() {
    let mut bind: &[u8] = &[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
    let err = read_request(&mut bind).await.unwrap_err();
    assert_eq!(err.reply(), Some(Reply::CommandNotSupported));

    let mut unknown_atyp: &[u8] = &[0x05, 0x01, 0x00, 0x09];
    let err = read_request(&mut unknown_atyp).await.unwrap_err();
    assert_eq!(err.reply(), Some(Reply::AddressTypeNotSupported));

    let mut truncated: &[u8] = &[0x05, 0x01, 0x00, 0x01, 127];
    let err = read_request(&mut truncated).await.unwrap_err();
    assert_eq!(err.reply(), None);
  }

  #[test]
  fn replies_carry_bound_address() {
    let bound: SocketAddr = "127.0.0.1:1080".parse().unwrap();
    assert_eq!(
      encode_reply(Reply::Succeeded, Some(bound)),
      vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]
    );
    assert_eq!(
      encode_reply(Reply::HostUnreachable, None),
      vec![0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );
  }
}
