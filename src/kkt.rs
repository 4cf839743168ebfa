//! KKT printer capability.
//!
//! The hardware is opaque to the Adapter: one `print` call with a 10s
//! budget, answered with ok / timeout / hardware_error. A print failure is a
//! P2 alert, never a request failure; the fiscal document is already
//! captured durably by the time the driver is invoked.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintOutcome {
    Printed,
    Timeout,
    HardwareError(String),
}

#[async_trait]
pub trait KktDriver: Send + Sync {
    async fn print(&self, payload: &Value) -> PrintOutcome;
}

/// Driver shim spoken over HTTP: `POST {base}/print` with the fiscal
/// document, answered with `{status: "ok" | "error", detail?}`.
pub struct HttpKktDriver {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PrintResponse {
    status: String,
    #[serde(default)]
    detail: Option<String>,
}

impl HttpKktDriver {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(HttpKktDriver {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl KktDriver for HttpKktDriver {
    async fn print(&self, payload: &Value) -> PrintOutcome {
        let url = format!("{}/print", self.base_url);
        let response = match self.http.post(&url).json(payload).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return PrintOutcome::Timeout,
            Err(e) => return PrintOutcome::HardwareError(e.to_string()),
        };

        if !response.status().is_success() {
            return PrintOutcome::HardwareError(format!("HTTP {}", response.status()));
        }

        match response.json::<PrintResponse>().await {
            Ok(r) if r.status == "ok" => PrintOutcome::Printed,
            Ok(r) => PrintOutcome::HardwareError(
                r.detail.unwrap_or_else(|| format!("driver status {}", r.status)),
            ),
            Err(e) => PrintOutcome::HardwareError(format!("malformed driver response: {e}")),
        }
    }
}

/// Stand-in when no printer is attached (dev boxes, dark kitchens). Reports
/// success so the flow stays identical.
pub struct NullKktDriver;

#[async_trait]
impl KktDriver for NullKktDriver {
    async fn print(&self, _payload: &Value) -> PrintOutcome {
        info!("No KKT attached, skipping print");
        PrintOutcome::Printed
    }
}
