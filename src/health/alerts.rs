use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};

pub const SERVER_DOWN: &str = "BE Server Down";
pub const REGION_DOWN: &str = "All BE Servers Down in Region";

/// Alert payload delivered to the webhook as `{type, message}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl Alert {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// Fire-and-forget alert delivery. Implementations must not block the caller.
pub trait AlertSink: Send + Sync {
    fn dispatch(&self, alert: Alert);
}

pub struct WebhookAlertSink {
    client: Client,
    url: Option<String>,
}

impl WebhookAlertSink {
    pub fn new(client: Client, url: Option<String>) -> Self {
        Self { client, url }
    }
}

impl AlertSink for WebhookAlertSink {
    fn dispatch(&self, alert: Alert) {
        metrics::counter!("lb_alerts_total", "type" => alert.kind.clone()).increment(1);

        let url = match &self.url {
            Some(url) => url.clone(),
            None => {
                warn!("No alert webhook configured, dropping alert: {} - {}", alert.kind, alert.message);
                return;
            }
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&alert).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Alert sent: {} - {}", alert.kind, alert.message);
                }
                Ok(response) => {
                    error!("Alert webhook answered {} for alert {}", response.status(), alert.kind);
                }
                Err(e) => {
                    error!("Failed to send alert {}: {}", alert.kind, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{extract::State, routing::post, Json, Router};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    #[test]
    fn test_alert_serializes_type_field() {
        let alert = Alert::new(SERVER_DOWN, "Server http://a in region us-east is down");
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["type"], "BE Server Down");
        assert_eq!(value["message"], "Server http://a in region us-east is down");
    }

    #[tokio::test]
    async fn test_webhook_receives_alert() {
        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(store): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        store.lock().push(body);
                    },
                ),
            )
            .with_state(received.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sink = WebhookAlertSink::new(Client::new(), Some(format!("http://{}/hook", addr)));
        sink.dispatch(Alert::new(REGION_DOWN, "All backend servers in us-east are down"));

        for _ in 0..50 {
            if !received.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], REGION_DOWN);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_swallowed() {
        let sink = WebhookAlertSink::new(Client::new(), Some("http://127.0.0.1:1/hook".to_string()));
        sink.dispatch(Alert::new(SERVER_DOWN, "down"));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
