//! service wide defaults for alert responses
//!
//! The `responder` section of the config file is deserialized into
//! [ResponderSettings] and validated into an immutable [Config]. A reload
//! builds a new [Config] and swaps it into the [ConfigHandle] as a whole, so
//! alerts that are already being handled keep the instance they started with.

use std::{
	path::{Path, PathBuf},
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use serde::{Deserialize, Serialize, Serializer};
use serde_with::{serde_as, DisplayFromStr, DurationSecondsWithFrac};
use thiserror::Error;

pub const DEFAULT_SSH_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOCAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("{what} does not exist: {}", path.display())]
	MissingFile { what: &'static str, path: PathBuf },
	#[error("no ssh_user configured and the current user is unknown")]
	UnknownUser,
}

/// `responder` section of the config file
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponderSettings {
	pub ssh_user: String,
	pub ssh_key: Option<PathBuf>,
	pub ssh_password: Option<String>,
	pub ssh_certificate: Option<PathBuf>,
	pub ssh_known_hosts: Option<PathBuf>,
	pub ssh_host_key_algorithms: Vec<String>,
	#[serde_as(as = "Option<DisplayFromStr>")]
	pub ssh_connection_timeout: Option<humantime::Duration>,
	#[serde_as(as = "Option<DisplayFromStr>")]
	pub ssh_command_timeout: Option<humantime::Duration>,
	#[serde_as(as = "Option<DisplayFromStr>")]
	pub local_command_timeout: Option<humantime::Duration>,
}

/// validated defaults every alert response starts from
#[serde_as]
#[derive(Clone, PartialEq, Serialize)]
pub struct Config {
	pub ssh_user: String,
	pub ssh_key: Option<PathBuf>,
	#[serde(serialize_with = "redact")]
	pub ssh_password: Option<String>,
	pub ssh_certificate: Option<PathBuf>,
	pub ssh_known_hosts: Option<PathBuf>,
	pub ssh_host_key_algorithms: Vec<String>,
	#[serde_as(as = "DurationSecondsWithFrac<f64>")]
	pub ssh_connection_timeout: Duration,
	#[serde_as(as = "DurationSecondsWithFrac<f64>")]
	pub ssh_command_timeout: Duration,
	#[serde_as(as = "DurationSecondsWithFrac<f64>")]
	pub local_command_timeout: Duration,
}

impl std::fmt::Debug for Config {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Config")
			.field("ssh_user", &self.ssh_user)
			.field("ssh_key", &self.ssh_key)
			.field("ssh_password", &self.ssh_password.as_ref().map(|_| "<secret>"))
			.field("ssh_certificate", &self.ssh_certificate)
			.field("ssh_known_hosts", &self.ssh_known_hosts)
			.field("ssh_host_key_algorithms", &self.ssh_host_key_algorithms)
			.field("ssh_connection_timeout", &self.ssh_connection_timeout)
			.field("ssh_command_timeout", &self.ssh_command_timeout)
			.field("local_command_timeout", &self.local_command_timeout)
			.finish()
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			ssh_user: String::new(),
			ssh_key: None,
			ssh_password: None,
			ssh_certificate: None,
			ssh_known_hosts: None,
			ssh_host_key_algorithms: Vec::new(),
			ssh_connection_timeout: DEFAULT_SSH_CONNECTION_TIMEOUT,
			ssh_command_timeout: DEFAULT_SSH_COMMAND_TIMEOUT,
			local_command_timeout: DEFAULT_LOCAL_COMMAND_TIMEOUT,
		}
	}
}

impl TryFrom<ResponderSettings> for Config {
	type Error = ConfigError;

	fn try_from(settings: ResponderSettings) -> Result<Self, Self::Error> {
		let ssh_user = match settings.ssh_user.trim() {
			"" => current_user().ok_or(ConfigError::UnknownUser)?,
			user => user.to_owned(),
		};

		let ssh_key = existing_file("ssh key", settings.ssh_key)?;
		let ssh_certificate = existing_file("ssh certificate", settings.ssh_certificate)?;
		let ssh_known_hosts = existing_file("ssh known hosts", settings.ssh_known_hosts)?;

		Ok(Self {
			ssh_user,
			ssh_key,
			ssh_password: settings.ssh_password.filter(|password| !password.is_empty()),
			ssh_certificate,
			ssh_known_hosts,
			ssh_host_key_algorithms: settings.ssh_host_key_algorithms,
			ssh_connection_timeout: or_default(
				settings.ssh_connection_timeout,
				DEFAULT_SSH_CONNECTION_TIMEOUT,
			),
			ssh_command_timeout: or_default(settings.ssh_command_timeout, DEFAULT_SSH_COMMAND_TIMEOUT),
			local_command_timeout: or_default(
				settings.local_command_timeout,
				DEFAULT_LOCAL_COMMAND_TIMEOUT,
			),
		})
	}
}

fn current_user() -> Option<String> {
	["USER", "LOGNAME"]
		.iter()
		.filter_map(|var| std::env::var(var).ok())
		.find(|user| !user.is_empty())
}

fn existing_file(what: &'static str, path: Option<PathBuf>) -> Result<Option<PathBuf>, ConfigError> {
	match path {
		Some(path) if path.as_os_str().is_empty() => Ok(None),
		Some(path) if !Path::new(&path).is_file() => Err(ConfigError::MissingFile { what, path }),
		path => Ok(path),
	}
}

/// absent and zero durations both fall back to the default
fn or_default(value: Option<humantime::Duration>, default: Duration) -> Duration {
	value.map(|duration| *duration).filter(|duration| !duration.is_zero()).unwrap_or(default)
}

fn redact<S: Serializer>(password: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
	match password {
		Some(_) => serializer.serialize_str("<secret>"),
		None => serializer.serialize_none(),
	}
}

/// holds the current [Config], swapped as a whole on reload
#[derive(Debug)]
pub struct ConfigHandle {
	current: Mutex<Arc<Config>>,
}

impl ConfigHandle {
	pub fn new(config: Config) -> Self {
		Self { current: Mutex::new(Arc::new(config)) }
	}

	/// the config in effect right now
	pub fn current(&self) -> Arc<Config> {
		Arc::clone(&self.lock())
	}

	/// replace the config, alerts already in flight keep their old instance
	pub fn replace(&self, config: Config) {
		let config = Arc::new(config);
		*self.lock() = config;
	}

	fn lock(&self) -> MutexGuard<'_, Arc<Config>> {
		// the guarded value is a plain pointer swap, a poisoned lock still holds a complete config
		self.current.lock().unwrap_or_else(PoisonError::into_inner)
	}
}
