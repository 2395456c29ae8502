// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! A SOCKS5 front-end racing direct, HTTP-tunnelled, and QUIC-multiplexed upstream connectors

pub mod common;
pub mod util;

pub mod client;
pub mod server;
