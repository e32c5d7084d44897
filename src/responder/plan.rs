//! Here we resolve what has to be executed for a single alert.
//!
//! The service wide [Config] provides the defaults, annotations on the alert
//! override them. Trust material (password, known hosts, host key algorithms)
//! can only be configured by the operator and is never taken from an alert.
//!
//! An empty annotation unsets the value it names, so `cr_ssh_key: ""` drops a
//! configured key and the next auth method applies. The ssh user is the
//! exception: there is always a user, an empty `cr_ssh_user` keeps the
//! configured one.

use std::{path::PathBuf, time::Duration};

use serde::Serialize;
use thiserror::Error;

use super::config::Config;
use crate::alert::Alert;

pub const STATUS_ANNOTATION: &str = "cr_status";
pub const SSH_USER_ANNOTATION: &str = "cr_ssh_user";
pub const SSH_KEY_ANNOTATION: &str = "cr_ssh_key";
pub const SSH_CERT_ANNOTATION: &str = "cr_ssh_cert";
pub const SSH_HOST_ANNOTATION: &str = "cr_ssh_host";
pub const SSH_CONN_TIMEOUT_ANNOTATION: &str = "cr_ssh_conn_timeout";
pub const SSH_COMMAND_ANNOTATION: &str = "cr_ssh_cmd";
pub const SSH_COMMAND_TIMEOUT_ANNOTATION: &str = "cr_ssh_cmd_timeout";
pub const LOCAL_COMMAND_ANNOTATION: &str = "cr_local_cmd";
pub const LOCAL_COMMAND_TIMEOUT_ANNOTATION: &str = "cr_local_cmd_timeout";

const DEFAULT_STATUS: &str = "firing";

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("unable to parse {annotation} annotation {value:?}: {source}")]
	InvalidDuration {
		annotation: &'static str,
		value: String,
		source: humantime::DurationError,
	},
}

/// everything needed to respond to one alert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
	/// alert statuses this plan applies to
	pub status_filter: Vec<String>,
	pub remote: RemotePlan,
	pub local: LocalPlan,
}

#[derive(Clone, PartialEq, Serialize)]
pub struct RemotePlan {
	pub user: String,
	pub key: Option<PathBuf>,
	pub certificate: Option<PathBuf>,
	#[serde(skip)]
	pub password: Option<String>,
	pub known_hosts: Option<PathBuf>,
	pub host_key_algorithms: Vec<String>,
	pub connection_timeout: Duration,
	pub command_timeout: Duration,
	pub host: Option<String>,
	pub command: Option<String>,
}

impl std::fmt::Debug for RemotePlan {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RemotePlan")
			.field("user", &self.user)
			.field("key", &self.key)
			.field("certificate", &self.certificate)
			.field("password", &self.password.as_ref().map(|_| "<secret>"))
			.field("known_hosts", &self.known_hosts)
			.field("host_key_algorithms", &self.host_key_algorithms)
			.field("connection_timeout", &self.connection_timeout)
			.field("command_timeout", &self.command_timeout)
			.field("host", &self.host)
			.field("command", &self.command)
			.finish()
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalPlan {
	pub command: Option<String>,
	pub timeout: Duration,
}

impl ExecutionPlan {
	pub fn is_empty(&self) -> bool {
		self.local.command.is_none() && self.remote.command.is_none()
	}
}

/// statuses listed in the `cr_status` annotation, `firing` when absent
pub fn status_filter(alert: &Alert) -> Vec<String> {
	match alert.annotation(STATUS_ANNOTATION) {
		Some(statuses) => statuses
			.split(',')
			.map(str::trim)
			.filter(|status| !status.is_empty())
			.map(str::to_owned)
			.collect(),
		None => vec![DEFAULT_STATUS.to_owned()],
	}
}

/// Build the [ExecutionPlan] for `alert`.
///
/// Returns `Ok(None)` if the alert's status is not part of its status filter,
/// such an alert needs no response at all. A malformed duration annotation
/// fails the whole resolution.
pub fn resolve(config: &Config, alert: &Alert) -> Result<Option<ExecutionPlan>, ResolveError> {
	let status_filter = status_filter(alert);
	if !status_filter.iter().any(|status| *status == alert.status) {
		tracing::debug!(
			status = %alert.status,
			expected = %status_filter.join(","),
			"alert status does not match status filter"
		);
		return Ok(None);
	}

	let remote = RemotePlan {
		// never unset
		user: text(alert, SSH_USER_ANNOTATION).unwrap_or_else(|| config.ssh_user.clone()),
		key: path(alert, SSH_KEY_ANNOTATION, &config.ssh_key),
		certificate: path(alert, SSH_CERT_ANNOTATION, &config.ssh_certificate),
		password: config.ssh_password.clone(),
		known_hosts: config.ssh_known_hosts.clone(),
		host_key_algorithms: config.ssh_host_key_algorithms.clone(),
		connection_timeout: duration(
			alert,
			SSH_CONN_TIMEOUT_ANNOTATION,
			config.ssh_connection_timeout,
		)?,
		command_timeout: duration(alert, SSH_COMMAND_TIMEOUT_ANNOTATION, config.ssh_command_timeout)?,
		host: text(alert, SSH_HOST_ANNOTATION),
		command: text(alert, SSH_COMMAND_ANNOTATION),
	};

	let local = LocalPlan {
		command: text(alert, LOCAL_COMMAND_ANNOTATION),
		timeout: duration(alert, LOCAL_COMMAND_TIMEOUT_ANNOTATION, config.local_command_timeout)?,
	};

	Ok(Some(ExecutionPlan { status_filter, remote, local }))
}

/// non empty annotation value, an empty one reads as absent
fn text(alert: &Alert, annotation: &str) -> Option<String> {
	alert.annotation(annotation).filter(|value| !value.trim().is_empty()).map(str::to_owned)
}

/// the annotation if present, an empty one unsets `default`
fn path(alert: &Alert, annotation: &str, default: &Option<PathBuf>) -> Option<PathBuf> {
	match alert.annotation(annotation) {
		Some(value) if value.trim().is_empty() => None,
		Some(value) => Some(PathBuf::from(value)),
		None => default.clone(),
	}
}

fn duration(
	alert: &Alert,
	annotation: &'static str,
	default: Duration,
) -> Result<Duration, ResolveError> {
	match alert.annotation(annotation) {
		Some(value) => humantime::parse_duration(value.trim()).map_err(|source| {
			ResolveError::InvalidDuration { annotation, value: value.to_owned(), source }
		}),
		None => Ok(default),
	}
}
