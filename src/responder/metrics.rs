//! prometheus meters for the responder

use prometheus::{opts, IntCounter, IntCounterVec, IntGaugeVec, Registry};

use super::ExecutionKind;

const NAMESPACE: &str = "command_responder";

#[derive(Debug, Clone)]
/// error counters shared by all alert handling tasks
pub struct ResponderMetrics {
	/// failed command executions by execution type
	command_errors: IntCounterVec,
	/// alerts whose handling failed, failed reloads and undecodable requests
	errors: IntCounter,
	build_info: IntGaugeVec,
}

impl ResponderMetrics {
	/// construct unregistered meters, see [ResponderMetrics::register]
	pub fn new() -> Result<Self, prometheus::Error> {
		let command_errors = IntCounterVec::new(
			opts!("command_errors_total", "Total number of command errors").namespace(NAMESPACE),
			&["type"],
		)?;
		for kind in [ExecutionKind::Local, ExecutionKind::Ssh] {
			command_errors.with_label_values(&[kind.as_str()]);
		}

		let errors =
			IntCounter::with_opts(opts!("errors_total", "Total number of errors").namespace(NAMESPACE))?;

		let build_info = IntGaugeVec::new(
			opts!("build_info", "Build information").namespace(NAMESPACE),
			&["version"],
		)?;
		build_info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);

		Ok(Self { command_errors, errors, build_info })
	}

	pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
		registry.register(Box::new(self.command_errors.clone()))?;
		registry.register(Box::new(self.errors.clone()))?;
		registry.register(Box::new(self.build_info.clone()))?;
		Ok(())
	}

	/// counts one failed command execution
	pub fn record_command_error(&self, kind: ExecutionKind) {
		self.command_errors.with_label_values(&[kind.as_str()]).inc();
	}

	pub fn record_error(&self) {
		self.errors.inc();
	}

	pub fn command_errors(&self, kind: ExecutionKind) -> u64 {
		self.command_errors.with_label_values(&[kind.as_str()]).get()
	}

	pub fn errors(&self) -> u64 {
		self.errors.get()
	}
}

#[cfg(test)]
mod tests {
	use prometheus::{Encoder, TextEncoder};

	use super::*;

	#[test]
	fn exposes_both_execution_types() {
		let registry = Registry::new();
		let metrics = ResponderMetrics::new().unwrap();
		metrics.register(&registry).unwrap();
		metrics.record_command_error(ExecutionKind::Ssh);

		let mut buffer = Vec::new();
		TextEncoder::new().encode(&registry.gather(), &mut buffer).unwrap();
		let text = String::from_utf8(buffer).unwrap();

		assert!(text.contains(r#"command_responder_command_errors_total{type="local"} 0"#));
		assert!(text.contains(r#"command_responder_command_errors_total{type="ssh"} 1"#));
		assert!(text.contains("command_responder_build_info"));
		assert_eq!(metrics.command_errors(ExecutionKind::Local), 0);
	}

	#[test]
	fn registering_twice_fails() {
		let registry = Registry::new();
		let metrics = ResponderMetrics::new().unwrap();
		metrics.register(&registry).unwrap();

		assert!(metrics.register(&registry).is_err());
	}
}
