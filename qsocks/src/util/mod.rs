// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::common::BrokerError;

pub mod cancellation;
pub mod tls;
pub mod tunnel_stream;
pub mod validators;

/// ALPN protocol spoken by session clients and stream servers
pub const ALPN_QSOCKS_1: &[u8] = b"qsocks-1";

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Copies bytes between `a` and `b` in both directions until either direction ends or `tunnel` is canceled
///
/// The first direction to finish cancels `tunnel`: with [BrokerError::Canceled] on a clean EOF,
/// or with the copy error. Both streams are dropped, and thereby closed, before returning.
/// Partially relayed data is never replayed.
#[tracing::instrument(level = "trace", skip_all)]
pub async fn relay_until_closed<A, B>(
  tunnel: &cancellation::CancelContext,
  a: A,
  b: B,
) -> BrokerError
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let (reader_a, mut sender_a) = tokio::io::split(a);
  let (reader_b, mut sender_b) = tokio::io::split(b);
  let mut reader_a = BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_a);
  let mut reader_b = BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_b);
  let proxy_a2b = tokio::io::copy_buf(&mut reader_a, &mut sender_b);
  let proxy_b2a = tokio::io::copy_buf(&mut reader_b, &mut sender_a);
  tracing::trace!("polling");
  let finished = tokio::select! {
    res = proxy_a2b => Some(res),
    res = proxy_b2a => Some(res),
    _ = tunnel.done() => None,
  };
  match finished {
    Some(Ok(bytes)) => {
      tracing::trace!(bytes, "relay direction reached end of stream");
      tunnel.cancel();
    }
    Some(Err(e)) => {
      tracing::debug!(error = %e, "relay direction failed");
      tunnel.cancel_with(e.into());
    }
    None => {}
  }
  tunnel.err().unwrap_or(BrokerError::Canceled)
}

/// Binds a loopback TCP echo server living for the rest of the test
/// Routes tracing output through the test harness; `RUST_LOG` overrides the default filter
#[cfg(test)]
pub(crate) fn init_test_logging() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,debug"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_test_writer()
    .try_init();
}

#[cfg(test)]
pub(crate) async fn spawn_echo_server() -> std::net::SocketAddr {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
      });
    }
  });
  addr
}
