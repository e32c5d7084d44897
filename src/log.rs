use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_subscriber::{
	filter::LevelFilter, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
	EnvFilter,
};

use crate::settings::Settings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
	pub level: String,
}

impl Default for LogSettings {
	fn default() -> Self {
		Self { level: "info".to_owned() }
	}
}

impl LogSettings {
	pub fn global() -> &'static Self {
		&Settings::global().log
	}
}

fn filter(level: &str) -> Result<EnvFilter> {
	let level = tracing::Level::from_str(level)
		.with_context(|| format!("invalid log level {:?}", level))?;

	Ok(EnvFilter::default()
		.add_directive(LevelFilter::from_level(level).into())
		.add_directive("hyper=warn".parse()?)
		.add_directive("tower=warn".parse()?)
		.add_directive("tower_http=warn".parse()?))
}

pub fn setup_logging() -> Result<()> {
	let filter_layer = filter(&LogSettings::global().level)?;
	let fmt_layer = fmt::layer();

	let registry = tracing_subscriber::registry().with(filter_layer).with(fmt_layer);

	#[cfg(feature = "console")]
	let registry = registry.with(console_subscriber::spawn());

	registry.try_init().context("a global subscriber is already installed")?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn levels() {
		for level in ["error", "Warn", "INFO", "debug", "trace"] {
			assert!(filter(level).is_ok(), "{}", level);
		}

		assert!(filter("verbose").is_err());
	}
}
