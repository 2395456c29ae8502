// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use qsocks::util;
use std::path::PathBuf;

use util::validators::{
  parse_connector_specs, parse_duration, parse_socketaddr, parse_stream_count,
  validate_connector_specs, validate_duration, validate_existing_file, validate_socketaddr,
  validate_stream_count,
};

mod certgen;
mod client;
mod server;

const DEFAULT_LOG_FILTER: &str = "quinn=warn,quinn_proto=warn,info";

/// Installs the global subscriber; `RUST_LOG` takes precedence over the `--log` directive
fn init_logging(directive: &str) -> Result<()> {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .or_else(|_| tracing_subscriber::EnvFilter::try_new(directive))
    .context("Invalid log filter directive")?;
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).context("Logger init must succeed")?;
  Ok(())
}

fn command() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("log")
        .long("log")
        .global(true)
        .takes_value(true)
        .default_value(DEFAULT_LOG_FILTER)
        .help("Log filter directive, overridden by RUST_LOG"),
    )
    .subcommand(
      Command::new("client")
        .alias("qsocks")
        .about("Run a local SOCKS5 listener racing the given connectors")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .takes_value(true)
            .default_value("127.0.0.1:10080"),
        )
        .arg(
          Arg::new("connect")
            .long("connect")
            .short('c')
            .help("Connectors as scheme://host:port, comma separated; scheme is direct, http, or session (default)")
            .validator(validate_connector_specs)
            .takes_value(true)
            .multiple_occurrences(true)
            .required(true),
        )
        .arg(
          Arg::new("timeout")
            .long("timeout")
            .short('t')
            .help("Deadline for each race, such as 500ms, 10s, or 1m")
            .validator(validate_duration)
            .takes_value(true)
            .default_value("10s"),
        )
        .arg(
          Arg::new("streams")
            .long("streams")
            .short('s')
            .help("Streams leased from one session before it is recycled")
            .validator(validate_stream_count)
            .takes_value(true)
            .default_value("5"),
        ),
    )
    .subcommand(
      Command::new("server")
        .alias("sqserver")
        .about("Run a QUIC stream server terminating session connectors")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .takes_value(true)
            .default_value("0.0.0.0:10086"),
        )
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("key"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("cert"),
        ),
    )
    .subcommand(
      Command::new("gateway")
        .about("Run an HTTP tunnel gateway for http:// connectors")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .takes_value(true)
            .default_value("0.0.0.0:10087"),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

fn main() -> Result<()> {
  let matches = command().get_matches();
  init_logging(matches.value_of("log").unwrap_or(DEFAULT_LOG_FILTER))?;
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .context("Tokio Runtime setup failure")?;
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      Err(err)
    }
    Ok(_) => {
      tracing::info!("{} exited successfully", mode);
      Ok(())
    }
  }
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let mut connectors = Vec::new();
  for value in args.values_of("connect").into_iter().flatten() {
    connectors.extend(parse_connector_specs(value)?);
  }
  Ok(client::ClientArgs {
    listen: parse_socketaddr(args.value_of("listen").unwrap_or_default())?,
    connectors,
    timeout: parse_duration(args.value_of("timeout").unwrap_or_default())?,
    streams_per_session: parse_stream_count(args.value_of("streams").unwrap_or_default())?,
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    listen: parse_socketaddr(args.value_of("listen").unwrap_or_default())?,
    cert: args.value_of("cert").map(PathBuf::from),
    key: args.value_of("key").map(PathBuf::from),
  })
}

pub fn gateway_arg_handling(args: &'_ ArgMatches) -> Result<server::GatewayArgs> {
  Ok(server::GatewayArgs {
    listen: parse_socketaddr(args.value_of("listen").unwrap_or_default())?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    Some(("server", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    Some(("gateway", opts)) => {
      let config = gateway_arg_handling(opts)?;
      tracing::info!("Running as tunnel gateway with config {:#?}", config);
      server::gateway_main(config).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      let path_raw = opts.value_of("path").unwrap_or_default();
      let san = opts.value_of("san").unwrap_or("localhost");
      certgen::certgen_main(path_raw.into(), san.into()).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
