//! run commands on the host the responder is running on

use std::{
	process::{ExitStatus, Output, Stdio},
	time::Duration,
};

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum LocalError {
	#[error("local command is empty")]
	Empty,
	#[error("failed to start local command {command}: {source}")]
	Spawn { command: String, source: std::io::Error },
	#[error("failed to wait for local command {command}: {source}")]
	Wait { command: String, source: std::io::Error },
	#[error("local command {command} failed with {status}: {stderr}")]
	ExitStatus { command: String, status: ExitStatus, stderr: String },
	#[error("local command timed out: {command}")]
	TimedOut { command: String },
}

/// Run `command` and wait at most `timeout` for it to exit.
///
/// The command is split on whitespace, the first word is the program, there is
/// no shell involved. A command that outlives its timeout is killed.
pub async fn run_local(command: &str, timeout: Duration) -> Result<Output, LocalError> {
	let mut words = command.split_whitespace();
	let program = words.next().ok_or(LocalError::Empty)?;
	let args: Vec<&str> = words.collect();

	tracing::info!(program, args = %args.join(" "), "running local command");

	let child = Command::new(program)
		.args(&args)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn()
		.map_err(|source| LocalError::Spawn { command: command.to_owned(), source })?;

	// dropping the output future on timeout drops the child, which kills it
	let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
		Ok(output) => output.map_err(|source| LocalError::Wait { command: command.to_owned(), source })?,
		Err(_) => {
			tracing::error!("local command timed out");
			return Err(LocalError::TimedOut { command: command.to_owned() });
		}
	};

	if !output.status.success() {
		return Err(LocalError::ExitStatus {
			command: command.to_owned(),
			status: output.status,
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
		});
	}

	Ok(output)
}
