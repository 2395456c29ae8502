// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
pub mod connector;
pub mod error;
pub mod protocol;
pub mod race;
pub mod session;
pub mod transport;

pub use error::BrokerError;
