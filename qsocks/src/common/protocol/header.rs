// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Destination frame written at the start of every leased multiplexed stream
//!
//! ```text
//! +------+----------+---------+----------+
//! | TYPE | DST.PORT | HOSTLEN | DST.HOST |
//! +------+----------+---------+----------+
//! |  1   |  2 (BE)  |    1    | HOSTLEN  |
//! +------+----------+---------+----------+
//! ```
//!
//! The server answers with a single [OpenStatus] byte once it has dialed the destination.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Destination;
use crate::common::BrokerError;

pub const FRAME_TYPE_TCP_CONNECT: u8 = 0x01;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenStatus {
  Connected = 0x00,
  DialFailed = 0x01,
  UnsupportedFrame = 0x02,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationHeader {
  pub frame_type: u8,
  pub destination: Destination,
}

impl DestinationHeader {
  pub fn connect(destination: Destination) -> Self {
    Self {
      frame_type: FRAME_TYPE_TCP_CONNECT,
      destination,
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
    let host = self.destination.host.as_bytes();
    let host_len = u8::try_from(host.len()).map_err(|_| {
      BrokerError::protocol(format!(
        "destination host is {} bytes; at most 255 fit in a header",
        host.len()
      ))
    })?;
    let mut frame = Vec::with_capacity(4 + host.len());
    frame.push(self.frame_type);
    frame.extend_from_slice(&self.destination.port.to_be_bytes());
    frame.push(host_len);
    frame.extend_from_slice(host);
    Ok(frame)
  }

  pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), BrokerError> {
    let frame = self.encode()?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
  }

  pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, BrokerError> {
    let frame_type = r.read_u8().await?;
    let port = r.read_u16().await?;
    let host_len = r.read_u8().await? as usize;
    let mut host = vec![0u8; host_len];
    r.read_exact(&mut host).await?;
    let host = String::from_utf8(host)
      .map_err(|_| BrokerError::protocol("destination host is not valid UTF-8"))?;
    Ok(Self {
      frame_type,
      destination: Destination::new(host, port),
    })
  }
}

pub async fn write_status<W: AsyncWrite + Unpin>(
  w: &mut W,
  status: OpenStatus,
) -> Result<(), BrokerError> {
  w.write_u8(status as u8).await?;
  w.flush().await?;
  Ok(())
}

/// Waits for the server's verdict on a freshly written header
pub async fn read_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), BrokerError> {
  match r.read_u8().await? {
    0x00 => Ok(()),
    refused => Err(BrokerError::StreamRefused(refused)),
  }
}
