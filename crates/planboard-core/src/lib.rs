pub mod chart;
pub mod cli;
pub mod codec;
pub mod commands;
pub mod config;
pub mod edit;
pub mod location;
pub mod model;
pub mod preload;
pub mod render;
pub mod share;
pub mod store;

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting planboard"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.rc_file.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );
  let settings =
    config::Settings::from_config(&cfg)?;

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let location =
    location::UrlFileLocation::open(
      &data_dir,
      settings.share_base_url.clone(),
      &settings.share_param
    )
    .with_context(|| {
      format!(
        "failed to open state at {}",
        data_dir.display()
      )
    })?;
  let store =
    Arc::new(store::StateStore::open(
      Box::new(location),
      model::default_state()
    ));

  let runtime =
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context(
        "failed to start async runtime"
      )?;

  let session = commands::Session {
    store,
    settings,
    runtime
  };
  let command = cli
    .command
    .unwrap_or(cli::Command::Show {
      target: None
    });

  commands::dispatch(
    &session, command
  )?;

  info!("done");
  Ok(())
}
