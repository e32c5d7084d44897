//! run commands on remote hosts over ssh
//!
//! libssh2 is blocking, every connection is driven from a blocking task.
//! There is no way to abort a running command in place, a command that
//! outlives its timeout is abandoned and its connection is shut down under it.
//!
//! While a command runs its stdout and stderr are drained in turns, the
//! channel window is shared and a full stderr would otherwise stall stdout.

use std::{
	fmt,
	io::{ErrorKind, Read},
	net::{Shutdown, TcpStream, ToSocketAddrs},
	str::FromStr,
	thread,
	time::Duration,
};

use ssh2::{Channel, MethodType, Session};
use thiserror::Error;
use tokio::task::{self, JoinError, JoinHandle};

use self::{
	auth::{AuthError, AuthMethod},
	known_hosts::{HostKeyError, HostKeyVerifier},
};
use super::plan::RemotePlan;

mod auth;
mod known_hosts;
#[cfg(test)]
pub(super) mod test_server;

const DEFAULT_PORT: u16 = 22;

/// pause between output reads when neither stream had data
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum RemoteError {
	#[error("must provide ssh host using annotations")]
	MissingHost,
	#[error("no ssh command to run")]
	MissingCommand,
	#[error("invalid ssh host {0:?}")]
	InvalidHost(String),
	#[error("error setting up ssh auth: {source}")]
	Auth {
		#[from]
		source: AuthError,
	},
	#[error("failed to establish ssh connection to {target}: {source}")]
	Connect { target: Target, source: std::io::Error },
	#[error("ssh handshake with {target} failed: {source}")]
	Handshake { target: Target, source: ssh2::Error },
	#[error(transparent)]
	HostKey(#[from] HostKeyError),
	#[error("ssh authentication as {user} using {method} failed: {source}")]
	Authentication { user: String, method: &'static str, source: ssh2::Error },
	#[error("ssh authentication as {user} using {method} was rejected")]
	AuthenticationRejected { user: String, method: &'static str },
	#[error("failed to establish ssh session: {0}")]
	Session(#[source] ssh2::Error),
	#[error("failed to run ssh command: {0}")]
	Command(#[source] ssh2::Error),
	#[error("failed to read ssh command output: {0}")]
	Output(#[source] std::io::Error),
	#[error("ssh command exited with status {status}: {stderr}")]
	ExitStatus { status: i32, stderr: String },
	#[error("ssh command killed by signal {signal}: {stderr}")]
	Signal { signal: String, stderr: String },
	#[error("timeout executing ssh command: {command}")]
	TimedOut { command: String },
	#[error("ssh worker failed: {0}")]
	Join(#[from] JoinError),
}

/// `host` or `host:port` of the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
	pub host: String,
	pub port: u16,
}

impl FromStr for Target {
	type Err = RemoteError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || RemoteError::InvalidHost(s.to_owned());
		let s = s.trim();

		let (host, port) = if let Some(rest) = s.strip_prefix('[') {
			// [v6]:port or [v6]
			let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
			match rest.strip_prefix(':') {
				Some(port) => (host, Some(port)),
				None if rest.is_empty() => (host, None),
				None => return Err(invalid()),
			}
		} else {
			match s.rsplit_once(':') {
				// a bare v6 address has more than one colon
				Some((host, port)) if !host.contains(':') => (host, Some(port)),
				_ => (s, None),
			}
		};

		if host.is_empty() {
			return Err(invalid());
		}

		let port = match port {
			Some(port) => port.parse().map_err(|_| invalid())?,
			None => DEFAULT_PORT,
		};

		Ok(Self { host: host.to_owned(), port })
	}
}

impl fmt::Display for Target {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

/// what a successful remote command printed
#[derive(Debug, Clone, Default)]
pub struct RemoteOutput {
	pub stdout: String,
	pub stderr: String,
}

/// an authenticated ssh connection
struct Connection {
	session: Session,
	stream: TcpStream,
}

impl Connection {
	/// resolve the auth method, dial, verify the host key and authenticate
	fn open(target: &Target, plan: &RemotePlan) -> Result<Self, RemoteError> {
		let auth = AuthMethod::resolve(
			plan.key.as_deref(),
			plan.certificate.as_deref(),
			plan.password.as_deref(),
		)?;
		let verifier = HostKeyVerifier::new(plan.known_hosts.as_deref());

		tracing::debug!(timeout = ?plan.connection_timeout, auth = auth.name(), "dial ssh");
		let stream = dial(target, plan.connection_timeout)?;

		let handshake = |source| RemoteError::Handshake { target: target.clone(), source };
		let mut session = Session::new().map_err(handshake)?;
		session.set_timeout(millis(plan.connection_timeout));
		if !plan.host_key_algorithms.is_empty() {
			session
				.method_pref(MethodType::HostKey, &plan.host_key_algorithms.join(","))
				.map_err(handshake)?;
		}
		let session_stream = stream.try_clone().map_err(|source| RemoteError::Connect {
			target: target.clone(),
			source,
		})?;
		session.set_tcp_stream(session_stream);
		session.handshake().map_err(handshake)?;

		let (key, _) = session.host_key().ok_or(HostKeyError::Missing)?;
		verifier.verify(&target.host, target.port, key)?;

		let user = plan.user.as_str();
		auth.authenticate(&session, user).map_err(|source| RemoteError::Authentication {
			user: user.to_owned(),
			method: auth.name(),
			source,
		})?;
		if !session.authenticated() {
			return Err(RemoteError::AuthenticationRejected {
				user: user.to_owned(),
				method: auth.name(),
			});
		}

		// the command timeout is enforced by the caller
		session.set_timeout(0);

		Ok(Self { session, stream })
	}

	/// a handle that can shut the socket down while a command is running
	fn closer(&self) -> std::io::Result<TcpStream> {
		self.stream.try_clone()
	}

	fn exec(self, command: &str) -> Result<RemoteOutput, RemoteError> {
		let mut channel = self.session.channel_session().map_err(RemoteError::Session)?;
		channel.exec(command).map_err(RemoteError::Command)?;

		self.session.set_blocking(false);
		let drained = drain(&channel);
		self.session.set_blocking(true);
		let (stdout, stderr) = drained.map_err(RemoteError::Output)?;

		channel.wait_close().map_err(RemoteError::Command)?;
		let status = channel.exit_status().map_err(RemoteError::Command)?;
		// a killed command reports status 0
		let signal = channel.exit_signal().map_err(RemoteError::Command)?.exit_signal;

		if let Err(err) = self.session.disconnect(None, "command completed", None) {
			tracing::debug!("ssh disconnect failed: {}", err);
		}

		let output = RemoteOutput {
			stdout: String::from_utf8_lossy(&stdout).into_owned(),
			stderr: String::from_utf8_lossy(&stderr).into_owned(),
		};

		if let Some(signal) = signal {
			return Err(RemoteError::Signal { signal, stderr: output.stderr.trim().to_owned() });
		}
		if status != 0 {
			return Err(RemoteError::ExitStatus { status, stderr: output.stderr.trim().to_owned() });
		}

		Ok(output)
	}
}

/// Read stdout and stderr of `channel` until the remote side closes both.
///
/// The session must be in non-blocking mode.
fn drain(channel: &Channel) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
	let mut streams = [(channel.stream(0), Vec::new()), (channel.stderr(), Vec::new())];
	let mut buf = [0u8; 8192];

	loop {
		let mut progressed = false;
		for (stream, output) in streams.iter_mut() {
			match stream.read(&mut buf) {
				Ok(0) => {}
				Ok(read) => {
					output.extend_from_slice(&buf[..read]);
					progressed = true;
				}
				Err(err) if err.kind() == ErrorKind::WouldBlock => {}
				Err(err) => return Err(err),
			}
		}

		if !progressed {
			if channel.eof() {
				break;
			}
			thread::sleep(OUTPUT_POLL_INTERVAL);
		}
	}

	let [(_, stdout), (_, stderr)] = streams;
	Ok((stdout, stderr))
}

fn dial(target: &Target, timeout: Duration) -> Result<TcpStream, RemoteError> {
	let connect_error = |source| RemoteError::Connect { target: target.clone(), source };

	let addrs = (target.host.as_str(), target.port).to_socket_addrs().map_err(connect_error)?;

	let mut last_error = std::io::Error::new(std::io::ErrorKind::NotFound, "host did not resolve");
	for addr in addrs {
		match TcpStream::connect_timeout(&addr, timeout) {
			Ok(stream) => return Ok(stream),
			Err(err) => last_error = err,
		}
	}

	Err(connect_error(last_error))
}

fn millis(duration: Duration) -> u32 {
	u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Run the command of `plan` and wait at most `plan.command_timeout` for it
/// to complete.
///
/// The connection is closed on every way out of here, including a timeout.
pub async fn run_remote(plan: &RemotePlan) -> Result<RemoteOutput, RemoteError> {
	let host = plan.host.as_deref().ok_or(RemoteError::MissingHost)?;
	let command = plan.command.as_deref().ok_or(RemoteError::MissingCommand)?;
	let target: Target = host.parse()?;

	tracing::info!(%target, user = %plan.user, "running ssh command");

	let connection = {
		let target = target.clone();
		let plan = plan.clone();
		task::spawn_blocking(move || Connection::open(&target, &plan)).await??
	};

	let closer = connection
		.closer()
		.map_err(|source| RemoteError::Connect { target: target.clone(), source })?;

	let running = {
		let command = command.to_owned();
		task::spawn_blocking(move || connection.exec(&command))
	};

	race_command(plan.command_timeout, &closer, running, command).await
}

/// Wait for `running` until `timeout` elapses, then close the connection.
///
/// A command still running after the timeout is left behind, its result is
/// never looked at.
async fn race_command<T>(
	timeout: Duration,
	closer: &TcpStream,
	running: JoinHandle<Result<T, RemoteError>>,
	command: &str,
) -> Result<T, RemoteError> {
	let result = tokio::time::timeout(timeout, running).await;

	if let Err(err) = closer.shutdown(Shutdown::Both) {
		// already gone after a clean disconnect
		tracing::trace!("ssh connection shutdown: {}", err);
	}

	match result {
		Ok(joined) => joined?,
		Err(_) => {
			tracing::error!("timeout executing ssh command");
			Err(RemoteError::TimedOut { command: command.to_owned() })
		}
	}
}
