//! host key verification against an OpenSSH known hosts file

use std::path::{Path, PathBuf};

use ssh2::{CheckResult, KnownHostFileKind, Session};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostKeyError {
	#[error("ssh server did not present a host key")]
	Missing,
	#[error("unable to load known hosts '{}': {source}", path.display())]
	Load { path: PathBuf, source: ssh2::Error },
	#[error("host key for {host} not found in '{}'", path.display())]
	Unknown { host: String, path: PathBuf },
	#[error("host key for {host} does not match '{}'", path.display())]
	Mismatch { host: String, path: PathBuf },
	#[error("unable to check host key for {host} against '{}'", path.display())]
	Failure { host: String, path: PathBuf },
}

/// decides whether a server's host key is trusted
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerifier {
	/// accept every host key, used when no known hosts file is configured
	Insecure,
	KnownHosts(PathBuf),
}

impl HostKeyVerifier {
	pub fn new(known_hosts: Option<&Path>) -> Self {
		match known_hosts {
			Some(path) if !path.as_os_str().is_empty() => Self::KnownHosts(path.to_owned()),
			_ => Self::Insecure,
		}
	}

	/// Check the raw host `key` presented by `host:port`.
	///
	/// The known hosts file is read on every check, a broken file shows up
	/// here and not when the verifier is built.
	pub fn verify(&self, host: &str, port: u16, key: &[u8]) -> Result<(), HostKeyError> {
		let path = match self {
			Self::Insecure => return Ok(()),
			Self::KnownHosts(path) => path,
		};

		tracing::debug!(
			host,
			port,
			key = %base64::encode(key),
			known_hosts = %path.display(),
			"verify ssh known hosts"
		);

		let load = |source| HostKeyError::Load { path: path.clone(), source };
		let session = Session::new().map_err(load)?;
		let mut known_hosts = session.known_hosts().map_err(load)?;
		known_hosts.read_file(path, KnownHostFileKind::OpenSSH).map_err(load)?;

		let host_port = if port == 22 { host.to_owned() } else { format!("[{}]:{}", host, port) };

		match known_hosts.check_port(host, port, key) {
			CheckResult::Match => Ok(()),
			CheckResult::NotFound => Err(HostKeyError::Unknown { host: host_port, path: path.clone() }),
			CheckResult::Mismatch => {
				Err(HostKeyError::Mismatch { host: host_port, path: path.clone() })
			}
			CheckResult::Failure => Err(HostKeyError::Failure { host: host_port, path: path.clone() }),
		}
	}
}
