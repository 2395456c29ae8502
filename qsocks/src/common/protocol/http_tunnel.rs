// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! The `POST`-based handshake spoken between an HTTP tunnel connector and a gateway
//!
//! The client sends a bodiless request naming its destination in a `Proxy` header; the gateway
//! answers `201 Created` once the destination is dialed, after which the connection carries raw bytes.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Destination;
use crate::common::BrokerError;

pub const MAX_LINE_LENGTH: usize = 4096;
pub const PROXY_HEADER: &str = "Proxy";

pub const RESPONSE_CREATED: &[u8] = b"HTTP/1.1 201 Created\r\nContent-Length:0\r\n\r\n";
pub const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length:0\r\n\r\n";
pub const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length:0\r\n\r\n";

pub fn encode_request(gateway: &str, destination: &Destination) -> Vec<u8> {
  format!(
    "POST / HTTP/1.1\r\nHOST:{}\r\n{}:{}\r\n\r\n",
    gateway, PROXY_HEADER, destination
  )
  .into_bytes()
}

pub async fn write_request<W: AsyncWrite + Unpin>(
  w: &mut W,
  gateway: &str,
  destination: &Destination,
) -> Result<(), BrokerError> {
  w.write_all(&encode_request(gateway, destination)).await?;
  w.flush().await?;
  Ok(())
}

/// Reads one CRLF- or LF-terminated line, without its terminator
///
/// Lines longer than [MAX_LINE_LENGTH] and streams ending mid-line are protocol errors.
pub async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String, BrokerError> {
  let mut line = Vec::new();
  let read = (&mut *r)
    .take(MAX_LINE_LENGTH as u64)
    .read_until(b'\n', &mut line)
    .await?;
  if line.last() != Some(&b'\n') {
    return Err(if read >= MAX_LINE_LENGTH {
      BrokerError::protocol(format!("line exceeds {} bytes", MAX_LINE_LENGTH))
    } else {
      BrokerError::protocol("connection closed mid-line")
    });
  }
  line.pop();
  if line.last() == Some(&b'\r') {
    line.pop();
  }
  String::from_utf8(line).map_err(|_| BrokerError::protocol("line is not valid UTF-8"))
}

/// Consumes a gateway response up to and including the empty line ending its headers
///
/// Fails with [BrokerError::TunnelRefused] unless the status code is `201`.
pub async fn read_response<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<(), BrokerError> {
  let status_line = read_line(r).await?;
  let status_code = status_line.split_whitespace().nth(1);
  if status_code != Some("201") {
    return Err(BrokerError::TunnelRefused(status_line));
  }
  while !read_line(r).await?.is_empty() {}
  Ok(())
}

/// Parses a tunnel request as seen by the gateway, returning the requested destination
///
/// `Ok(None)` means the request was well-formed but carried no usable `Proxy` header.
pub async fn read_request<R: AsyncBufRead + Unpin>(
  r: &mut R,
) -> Result<Option<Destination>, BrokerError> {
  let request_line = read_line(r).await?;
  let mut tokens = request_line.split_whitespace();
  match (tokens.next(), tokens.next(), tokens.next()) {
    (Some("POST"), Some(_path), Some("HTTP/1.1")) => {}
    _ => {
      return Err(BrokerError::protocol(format!(
        "unexpected tunnel request line {:?}",
        request_line
      )))
    }
  }
  let mut destination = None;
  loop {
    let header = read_line(r).await?;
    if header.is_empty() {
      break;
    }
    if let Some((name, value)) = header.split_once(':') {
      if name.trim().eq_ignore_ascii_case(PROXY_HEADER) {
        destination = parse_host_port(value.trim());
      }
    }
  }
  Ok(destination)
}

fn parse_host_port(value: &str) -> Option<Destination> {
  let (host, port) = value.rsplit_once(':')?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return None;
  }
  Some(Destination::new(host, port.parse().ok()?))
}
