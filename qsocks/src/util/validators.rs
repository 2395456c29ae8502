// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::connector::ConnectorSpec;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

/// Parses `250ms`, `10s`, `2m`, `1h`, or a bare number of seconds
pub fn parse_duration(v: &str) -> Result<Duration> {
  let v = v.trim();
  let split = v
    .find(|c: char| !c.is_ascii_digit() && c != '.')
    .unwrap_or(v.len());
  let (amount, unit) = v.split_at(split);
  let amount = amount
    .parse::<f64>()
    .map_err(|_| AnyErr::msg("Duration must start with a number"))?;
  let seconds = match unit.trim() {
    "ms" => amount / 1000.0,
    "" | "s" => amount,
    "m" => amount * 60.0,
    "h" => amount * 3600.0,
    other => return Err(AnyErr::msg(format!("Unknown duration unit {:?}", other))),
  };
  Duration::try_from_secs_f64(seconds).map_err(|e| AnyErr::msg(e.to_string()))
}

pub fn parse_stream_count(v: &str) -> Result<usize> {
  match v.parse::<usize>() {
    Ok(0) => Err(AnyErr::msg("At least one stream per session is required")),
    Ok(n) => Ok(n),
    Err(_) => Err(AnyErr::msg("Stream count must be a positive integer")),
  }
}

/// Parses a comma-separated list of `scheme://host:port` connector targets
pub fn parse_connector_specs(v: &str) -> Result<Vec<ConnectorSpec>> {
  let specs = v
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(|s| s.parse::<ConnectorSpec>().map_err(AnyErr::from))
    .collect::<Result<Vec<_>>>()?;
  if specs.is_empty() {
    return Err(AnyErr::msg("At least one connector is required"));
  }
  Ok(specs)
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_duration(v: &str) -> Result<(), String> {
  parse_duration(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_stream_count(v: &str) -> Result<(), String> {
  parse_stream_count(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_connector_specs(v: &str) -> Result<(), String> {
  parse_connector_specs(v)
    .map(|_| ())
    .map_err(|e| e.to_string())
}
