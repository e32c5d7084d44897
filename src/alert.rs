//! data structures for deserializing incoming alerts
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
/// data from prometheus received by the alertmanager webhook receiver
#[allow(clippy::missing_docs_in_private_items)]
pub struct Data {
	pub version: String,
	pub group_key: String,

	pub receiver: String,
	pub status: String,
	pub alerts: Vec<Alert>,
	pub group_labels: HashMap<String, String>,
	pub common_labels: HashMap<String, String>,
	pub common_annotations: HashMap<String, String>,
	#[serde(rename = "externalURL")]
	pub external_url: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::missing_docs_in_private_items)]
pub struct Alert {
	pub status: String,
	#[serde(default)]
	pub labels: HashMap<String, String>,
	#[serde(default)]
	pub annotations: HashMap<String, String>,
	#[serde(default)]
	pub starts_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub ends_at: Option<DateTime<Utc>>,
	#[serde(rename = "generatorURL", default)]
	pub generator_url: String,
	#[serde(default)]
	pub fingerprint: String,
}

impl Alert {
	/// the `alertname` label, or the fingerprint for alerts without one
	pub fn name(&self) -> &str {
		self.labels.get("alertname").unwrap_or(&self.fingerprint)
	}

	pub fn annotation(&self, key: &str) -> Option<&str> {
		self.annotations.get(key).map(String::as_str)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn name_falls_back_to_fingerprint() {
		let mut alert = Alert {
			labels: HashMap::from([("alertname".to_owned(), "foo".to_owned())]),
			fingerprint: "bar".to_owned(),
			..Default::default()
		};
		assert_eq!(alert.name(), "foo");

		alert.labels.clear();
		assert_eq!(alert.name(), "bar");
	}

	#[test]
	fn deserializes_webhook_payload() {
		let data: Data = serde_json::from_str(
			r#"{
				"version": "4",
				"groupKey": "{}:{alertname=\"NodeDown\"}",
				"receiver": "responder",
				"status": "firing",
				"alerts": [{
					"status": "firing",
					"labels": {"alertname": "NodeDown", "instance": "node1"},
					"annotations": {"cr_local_cmd": "systemctl restart node_exporter"},
					"startsAt": "2022-05-01T10:00:00Z",
					"endsAt": "0001-01-01T00:00:00Z",
					"generatorURL": "http://prometheus/graph",
					"fingerprint": "5d3f1c2b"
				}],
				"groupLabels": {"alertname": "NodeDown"},
				"commonLabels": {},
				"commonAnnotations": {},
				"externalURL": "http://alertmanager"
			}"#,
		)
		.unwrap();

		assert_eq!(data.alerts.len(), 1);
		let alert = &data.alerts[0];
		assert_eq!(alert.status, "firing");
		assert_eq!(alert.fingerprint, "5d3f1c2b");
		assert_eq!(alert.name(), "NodeDown");
		assert_eq!(alert.annotation("cr_local_cmd"), Some("systemctl restart node_exporter"));
	}

	#[test]
	fn minimal_alert_decodes() {
		let data: Data =
			serde_json::from_str(r#"{"alerts": [{"status": "resolved", "fingerprint": "x"}]}"#).unwrap();

		assert_eq!(data.alerts[0].status, "resolved");
		assert!(data.alerts[0].annotations.is_empty());
	}
}
