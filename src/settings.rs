use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Arg, Command};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::{
	alertmanager_webhook_receiver::AlertReceiverSettings,
	log::LogSettings,
	responder::{Config, ResponderSettings},
	telemetry_endpoint::TelemetryEndpointSettings,
};

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub log: LogSettings,
	pub alert_webhook_receiver: AlertReceiverSettings,
	pub telemetry_endpoint: TelemetryEndpointSettings,
	pub responder: ResponderSettings,
	/// file the settings were read from, read again on reload
	#[serde(skip)]
	pub config_path: PathBuf,
}

impl Settings {
	/// parse the command line and load the config file it names
	pub fn init() -> Result<&'static Self> {
		SETTINGS.get_or_try_init(|| {
			Self::load().context("failed to load config and command line arguments")
		})
	}

	pub fn global() -> &'static Self {
		SETTINGS.get_or_init(|| {
			match Self::load().context("failed to load config and command line arguments") {
				Ok(settings) => settings,
				Err(err) => {
					// tracing wasn't setup yet
					panic!("{:#?}", err);
				}
			}
		})
	}

	fn load() -> Result<Self> {
		let opts = Command::new(clap::crate_name!())
			.version(clap::crate_version!())
			.about(clap::crate_description!())
			.author(clap::crate_authors!())
			.args(&[
				Arg::new("config")
					.help("path of config file")
					.takes_value(true)
					.short('c')
					.long("config")
					.default_value("./command-responder.yaml"),
				Arg::new("level")
					.help("log level")
					.possible_values(["Error", "Warn", "Info", "Debug", "Trace"])
					.ignore_case(true)
					.takes_value(true)
					.long("log"),
			])
			.get_matches();

		let config_path = opts.value_of("config").unwrap_or("./command-responder.yaml");
		let mut settings = Self::read(Path::new(config_path))?;

		if let Some(level) = opts.value_of("level") {
			settings.log.level = level.to_string();
		}

		Ok(settings)
	}

	/// read all settings from the config file at `path`
	pub fn read(path: &Path) -> Result<Self> {
		let mut settings: Self = config::Config::builder()
			.add_source(config::File::from(path))
			.build()
			.and_then(config::Config::try_deserialize::<Self>)
			.with_context(|| format!("can't load config {}", path.display()))?;

		settings.config_path = path.to_owned();

		Ok(settings)
	}

	/// validated responder defaults from the settings loaded at startup
	pub fn responder_config(&self) -> Result<Config> {
		Config::try_from(self.responder.clone()).context("invalid responder config")
	}

	/// read the config file again and validate its `responder` section
	///
	/// Only the `responder` section takes effect, everything else requires a
	/// restart.
	pub fn reload_responder(&self) -> Result<Config> {
		Self::read(&self.config_path)?.responder_config()
	}
}
