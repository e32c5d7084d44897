//! Here we respond to alerts by running commands.
//!
//! Every alert is handled on its own task, see [Responder::dispatch]. Handling
//! an alert resolves its [plan::ExecutionPlan], runs the local command and then
//! the remote command. A failing local command does not prevent the remote
//! command from running.

use std::{sync::Arc, time::Instant};

use thiserror::Error;
use tracing::Instrument;

pub use self::{
	config::{Config, ConfigHandle, ResponderSettings},
	metrics::ResponderMetrics,
};
use self::{
	local::LocalError,
	plan::{ExecutionPlan, ResolveError},
	ssh::RemoteError,
};
use crate::alert::Alert;

mod config;
mod local;
mod metrics;
mod plan;
mod ssh;

/// where a command is executed, used as the `type` label of the error counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
	Local,
	Ssh,
}

impl ExecutionKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Local => "local",
			Self::Ssh => "ssh",
		}
	}
}

/// how an alert was handled, when nothing failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	/// the alert's status is not in its status filter
	Skipped,
	/// the alert carries no command
	Idle,
	Completed,
}

#[derive(Debug, Error)]
pub enum ResponseError {
	#[error(transparent)]
	Resolve(#[from] ResolveError),
	#[error(transparent)]
	Local(#[from] LocalError),
	#[error(transparent)]
	Remote(#[from] RemoteError),
}

#[derive(Debug)]
pub struct Responder {
	metrics: ResponderMetrics,
}

impl Responder {
	pub fn new(metrics: ResponderMetrics) -> Self {
		Self { metrics }
	}

	pub fn metrics(&self) -> &ResponderMetrics {
		&self.metrics
	}

	/// Handle `alert` on a new task and return without waiting for it.
	///
	/// `config` is the instance current when the alert was received, a reload
	/// while the alert is handled does not affect it.
	pub fn dispatch(self: &Arc<Self>, config: Arc<Config>, alert: Alert) {
		let responder = Arc::clone(self);
		tokio::spawn(async move {
			if let Err(err) = responder.handle(&config, &alert).await {
				tracing::error!(
					fingerprint = %alert.fingerprint,
					alertname = %alert.name(),
					"failed to respond to alert: {}",
					err
				);
				responder.metrics.record_error();
			}
		});
	}

	/// Respond to a single alert.
	///
	/// Returns the last error encountered. Each failed command is counted
	/// once for its [ExecutionKind].
	#[tracing::instrument(
		name = "alert",
		skip_all,
		fields(fingerprint = %alert.fingerprint, alertname = %alert.name())
	)]
	pub async fn handle(&self, config: &Config, alert: &Alert) -> Result<Outcome, ResponseError> {
		let plan = match plan::resolve(config, alert)? {
			Some(plan) => plan,
			None => return Ok(Outcome::Skipped),
		};

		if plan.is_empty() {
			tracing::debug!("alert carries no command");
			return Ok(Outcome::Idle);
		}

		let mut last_error: Option<ResponseError> = None;

		if let Some(command) = &plan.local.command {
			if let Err(err) = self.run_local(&plan, command).await {
				last_error = Some(err.into());
			}
		}

		if plan.remote.command.is_some() {
			if let Err(err) = self.run_remote(&plan).await {
				last_error = Some(err.into());
			}
		}

		match last_error {
			Some(err) => Err(err),
			None => Ok(Outcome::Completed),
		}
	}

	async fn run_local(&self, plan: &ExecutionPlan, command: &str) -> Result<(), LocalError> {
		let span = tracing::info_span!("execute", kind = "local", command);
		let started = Instant::now();

		match local::run_local(command, plan.local.timeout).instrument(span.clone()).await {
			Ok(output) => {
				span.in_scope(|| {
					tracing::info!(
						elapsed = ?started.elapsed(),
						stdout = %String::from_utf8_lossy(&output.stdout).trim(),
						stderr = %String::from_utf8_lossy(&output.stderr).trim(),
						"local command completed"
					)
				});
				Ok(())
			}
			Err(err) => {
				span.in_scope(|| tracing::error!("local command failed: {}", err));
				self.metrics.record_command_error(ExecutionKind::Local);
				Err(err)
			}
		}
	}

	async fn run_remote(&self, plan: &ExecutionPlan) -> Result<(), RemoteError> {
		let span = tracing::info_span!(
			"execute",
			kind = "ssh",
			command = plan.remote.command.as_deref().unwrap_or_default(),
			host = plan.remote.host.as_deref().unwrap_or_default()
		);
		let started = Instant::now();

		match ssh::run_remote(&plan.remote).instrument(span.clone()).await {
			Ok(output) => {
				span.in_scope(|| {
					tracing::info!(
						elapsed = ?started.elapsed(),
						stdout = %output.stdout.trim(),
						stderr = %output.stderr.trim(),
						"ssh command completed"
					)
				});
				Ok(())
			}
			Err(err) => {
				span.in_scope(|| tracing::error!("ssh command failed: {}", err));
				self.metrics.record_command_error(ExecutionKind::Ssh);
				Err(err)
			}
		}
	}
}
