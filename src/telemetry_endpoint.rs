//! Here we expose prometheus metrics about the responder
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use axum::{
	body::Body,
	http::{header::CONTENT_TYPE, HeaderValue, Response, StatusCode},
	routing::get,
	Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;

use crate::settings::Settings;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryEndpointSettings {
	pub bind_address: IpAddr,
	pub port: u16,
}

impl Default for TelemetryEndpointSettings {
	fn default() -> Self {
		Self { bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 10001 }
	}
}

impl TelemetryEndpointSettings {
	pub fn global() -> &'static Self {
		&Settings::global().telemetry_endpoint
	}

	pub fn to_socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.bind_address, self.port)
	}
}

fn encode() -> Result<(String, Vec<u8>), prometheus::Error> {
	let mut buffer = vec![];
	let encoder = TextEncoder::new();
	let metric_families = prometheus::gather();

	encoder.encode(&metric_families, &mut buffer)?;

	Ok((encoder.format_type().to_owned(), buffer))
}

async fn metrics_handler() -> Response<Body> {
	let (status, content_type, body) = match encode() {
		Ok((content_type, buffer)) => (StatusCode::OK, content_type, Body::from(buffer)),
		Err(err) => {
			tracing::error!("failed to encode metrics: {}", err);
			(StatusCode::INTERNAL_SERVER_ERROR, "text/plain".to_owned(), Body::from(err.to_string()))
		}
	};

	let mut response = Response::new(body);
	*response.status_mut() = status;
	if let Ok(content_type) = content_type.parse::<HeaderValue>() {
		response.headers_mut().insert(CONTENT_TYPE, content_type);
	}

	response
}

pub async fn run_telemetry_endpoint() -> Result<()> {
	let addr = TelemetryEndpointSettings::global().to_socket_addr();
	tracing::info!(%addr, "telemetry endpoint listening");

	let app = Router::new().route("/metrics", get(metrics_handler));
	axum::Server::try_bind(&addr)
		.with_context(|| format!("failed to bind telemetry endpoint to {}", addr))?
		.serve(app.into_make_service())
		.await
		.context("telemetry endpoint crashed")?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn serves_text_format() {
		let response = metrics_handler().await;

		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(
			response.headers().get(CONTENT_TYPE).and_then(|value| value.to_str().ok()),
			Some(TextEncoder::new().format_type())
		);
	}
}
