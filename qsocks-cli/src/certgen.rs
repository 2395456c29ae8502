// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use qsocks::util::tls;
use std::path::PathBuf;
use tracing::instrument;

#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  let path = PathBuf::from(output_base_path);
  tls::write_self_signed_pem(&path, &host_san)?;
  tracing::info!("Wrote {0}.pub.pem and {0}.priv.pem", path.display());
  Ok(())
}
