//! Here we receive alerts from alertmanager and hand every alert to the responder.
//!
//! The response is sent as soon as the alerts are dispatched, command results
//! only show up in the logs and metrics.

use std::{
	net::{IpAddr, Ipv4Addr, SocketAddr},
	sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
	body::Bytes,
	extract::Extension,
	handler::Handler,
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use prometheus::{opts, IntCounter};
use serde::{Deserialize, Serialize};

use crate::{
	alert,
	responder::{ConfigHandle, Responder},
	settings::Settings,
};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertReceiverSettings {
	pub bind_address: IpAddr,
	pub port: u16,
}

impl Default for AlertReceiverSettings {
	fn default() -> Self {
		Self { bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 10000 }
	}
}

impl AlertReceiverSettings {
	pub fn global() -> &'static Self {
		&Settings::global().alert_webhook_receiver
	}

	pub fn to_socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.bind_address, self.port)
	}
}

struct State {
	config: Arc<ConfigHandle>,
	responder: Arc<Responder>,
	received: IntCounter,
}

impl State {
	fn new(config: Arc<ConfigHandle>, responder: Arc<Responder>) -> Result<Self> {
		let received = IntCounter::with_opts(
			opts!("received_alerts_total", "total number of deserialized alerts")
				.namespace("command_responder")
				.subsystem("alertmanager_webhook"),
		)?;

		Ok(Self { config, responder, received })
	}
}

/// json body of every response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
	status: &'static str,
	status_code: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	data: Option<serde_json::Value>,
}

impl Envelope {
	fn success(status: StatusCode) -> Self {
		Self { status: "success", status_code: status.as_u16(), message: None, data: None }
	}

	fn error(status: StatusCode, message: impl Into<String>) -> Self {
		Self { status: "error", status_code: status.as_u16(), message: Some(message.into()), data: None }
	}

	fn ok(data: Option<serde_json::Value>) -> Self {
		Self { status: "ok", data, ..Self::success(StatusCode::OK) }
	}
}

impl IntoResponse for Envelope {
	fn into_response(self) -> Response {
		let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		(status, Json(self)).into_response()
	}
}

async fn post_alerts(Extension(state): Extension<Arc<State>>, body: Bytes) -> Envelope {
	let data: alert::Data = match serde_json::from_slice(&body) {
		Ok(data) => data,
		Err(err) => {
			tracing::debug!("failed to deserialize alerts: {:?}", err);
			state.responder.metrics().record_error();
			return Envelope::error(StatusCode::BAD_REQUEST, format!("invalid alert payload: {}", err));
		}
	};

	tracing::debug!(receiver = %data.receiver, alerts = data.alerts.len(), "received alerts");
	state.received.inc_by(data.alerts.len() as u64);

	let config = state.config.current();
	for alert in data.alerts {
		state.responder.dispatch(Arc::clone(&config), alert);
	}

	Envelope::success(StatusCode::CREATED)
}

async fn healthz() -> Envelope {
	Envelope::ok(None)
}

async fn version() -> Envelope {
	Envelope::ok(Some(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") })))
}

async fn config(Extension(state): Extension<Arc<State>>) -> Envelope {
	match serde_json::to_value(&*state.config.current()) {
		Ok(config) => Envelope::ok(Some(config)),
		Err(err) => {
			tracing::error!("failed to serialize config: {}", err);
			Envelope::error(StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize config")
		}
	}
}

async fn not_found() -> Envelope {
	Envelope::error(StatusCode::NOT_FOUND, "not found")
}

fn router(state: Arc<State>) -> Router {
	Router::new()
		.route("/alerts", post(post_alerts))
		.route("/healthz", get(healthz))
		.route("/version", get(version))
		.route("/config", get(config))
		.fallback(not_found.into_service())
		.layer(Extension(state))
}

pub async fn run_prometheus_receiver(
	config: Arc<ConfigHandle>,
	responder: Arc<Responder>,
) -> Result<()> {
	let state = Arc::new(State::new(config, responder)?);
	prometheus::register(Box::new(state.received.clone()))
		.context("failed to register received alerts counter")?;

	let addr = AlertReceiverSettings::global().to_socket_addr();
	tracing::info!(%addr, "alertmanager webhook receiver listening");

	axum::Server::try_bind(&addr)
		.with_context(|| format!("failed to bind alertmanager webhook receiver to {}", addr))?
		.serve(router(state).into_make_service())
		.await
		.context("prometheus endpoint crashed")?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;
	use crate::responder::{Config, ResponderMetrics};

	fn state() -> Arc<State> {
		let config = Config {
			ssh_user: "alertmanager".to_owned(),
			ssh_password: Some("hunter2".to_owned()),
			ssh_known_hosts: Some(PathBuf::from("/etc/ssh/ssh_known_hosts")),
			..Config::default()
		};
		let responder = Responder::new(ResponderMetrics::new().unwrap());

		Arc::new(State::new(Arc::new(ConfigHandle::new(config)), Arc::new(responder)).unwrap())
	}

	fn json(envelope: &Envelope) -> serde_json::Value {
		serde_json::to_value(envelope).unwrap()
	}

	#[tokio::test]
	async fn accepts_alerts() {
		let state = state();
		let body = Bytes::from_static(
			br#"{
				"receiver": "command-responder",
				"status": "firing",
				"alerts": [
					{"status": "firing", "labels": {"alertname": "a"}, "fingerprint": "1"},
					{"status": "resolved", "labels": {"alertname": "b"}, "fingerprint": "2"}
				]
			}"#,
		);

		let envelope = post_alerts(Extension(Arc::clone(&state)), body).await;

		assert_eq!(
			json(&envelope),
			serde_json::json!({ "status": "success", "statusCode": 201 })
		);
		assert_eq!(envelope.into_response().status(), StatusCode::CREATED);
		assert_eq!(state.received.get(), 2);
		assert_eq!(state.responder.metrics().errors(), 0);
	}

	#[tokio::test]
	async fn rejects_malformed_payload() {
		let state = state();

		let envelope = post_alerts(Extension(Arc::clone(&state)), Bytes::from_static(b"{\"alerts\": 3}")).await;

		let body = json(&envelope);
		assert_eq!(body["status"], "error");
		assert_eq!(body["statusCode"], 400);
		assert!(body["message"].as_str().unwrap().starts_with("invalid alert payload"));
		assert_eq!(envelope.into_response().status(), StatusCode::BAD_REQUEST);
		assert_eq!(state.received.get(), 0);
		assert_eq!(state.responder.metrics().errors(), 1);
	}

	#[tokio::test]
	async fn config_is_redacted() {
		let envelope = config(Extension(state())).await;
		let body = json(&envelope);

		assert_eq!(body["status"], "ok");
		assert_eq!(body["statusCode"], 200);
		assert_eq!(body["data"]["ssh_user"], "alertmanager");
		assert_eq!(body["data"]["ssh_password"], "<secret>");
		assert_eq!(body["data"]["ssh_command_timeout"], 10.0);
	}

	#[tokio::test]
	async fn status_endpoints() {
		assert_eq!(json(&healthz().await), serde_json::json!({ "status": "ok", "statusCode": 200 }));
		assert_eq!(json(&version().await)["data"]["version"], env!("CARGO_PKG_VERSION"));
		assert_eq!(not_found().await.into_response().status(), StatusCode::NOT_FOUND);
	}
}
