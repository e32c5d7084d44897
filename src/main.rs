//! prometheus alertmanager receiver that responds to alerts by running commands
//!
//! Features:
//! - commands run locally or on a remote host over ssh, configured per alert via annotations
//! - password, private key and certificate authentication, host keys checked against known hosts
//! - timeouts for local commands, ssh connections and ssh commands
//! - reload of the responder defaults on SIGHUP

use std::sync::Arc;

use anyhow::{Context, Result};
use responder::{ConfigHandle, Responder, ResponderMetrics};
use settings::Settings;
use tokio::signal::unix::{signal, SignalKind};

mod alert;
mod alertmanager_webhook_receiver;
mod log;
mod responder;
mod settings;
mod telemetry_endpoint;

/// exit the complete program if one thread panics
fn setup_panic_handler() {
	let default_panic = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		default_panic(info);
		std::process::exit(1);
	}));
}

/// reload the responder defaults on SIGHUP, return on any signal asking us to exit
async fn handle_signals(
	settings: &Settings,
	config: &ConfigHandle,
	responder: &Responder,
) -> Result<()> {
	let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
	let mut interrupt = signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;
	let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
	let mut quit = signal(SignalKind::quit()).context("failed to listen for SIGQUIT")?;

	loop {
		tokio::select! {
			_ = hangup.recv() => match settings.reload_responder() {
				Ok(reloaded) => {
					tracing::info!(config = ?reloaded, "reloaded responder config");
					config.replace(reloaded);
				}
				Err(err) => {
					tracing::error!("failed to reload config, keeping the previous one: {:#}", err);
					responder.metrics().record_error();
				}
			},
			_ = interrupt.recv() => break,
			_ = terminate.recv() => break,
			_ = quit.recv() => break,
		}
	}

	tracing::info!("received shutdown signal, exiting");

	Ok(())
}

/// the entry point of the program
#[tokio::main]
pub async fn main() -> Result<()> {
	setup_panic_handler();

	let settings = Settings::init()?;

	log::setup_logging().context("could not setup logging")?;

	let config = Arc::new(ConfigHandle::new(settings.responder_config()?));
	tracing::info!(config = ?config.current(), "loaded responder config");

	let metrics = ResponderMetrics::new().context("failed to construct metrics")?;
	metrics.register(prometheus::default_registry()).context("failed to register metrics")?;
	let responder = Arc::new(Responder::new(metrics));

	let receiver = tokio::spawn(alertmanager_webhook_receiver::run_prometheus_receiver(
		Arc::clone(&config),
		Arc::clone(&responder),
	));
	let telemetry = tokio::spawn(telemetry_endpoint::run_telemetry_endpoint());

	tokio::select! {
		result = receiver => result
			.context("alertmanager webhook receiver panicked")?
			.context("alertmanager webhook receiver failed to start or crashed")?,
		result = telemetry => result
			.context("telemetry endpoint panicked")?
			.context("telemetry endpoint failed to start or crashed")?,
		result = handle_signals(settings, &config, &responder) => result?,
	}

	Ok(())
}
