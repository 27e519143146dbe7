pub mod clip;
pub mod health;
pub mod image;
pub mod metrics;

use crate::error::{ClipRelayError, Result};
use serde::Deserialize;

/// Clip identity as sent by the caller.
///
/// Either plain `deviceId` / `eventId` query parameters or the webhook form
/// `params={"deviceId":..,"eventId":..}`. Other parameters (the segment-proxy
/// `seg` and `u`) are ignored here.
#[derive(Debug, Default, Deserialize)]
pub struct ClipQuery {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    #[serde(rename = "eventId")]
    pub event_id: Option<String>,
    pub params: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClipParams {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "eventId")]
    event_id: String,
}

impl ClipQuery {
    /// `(device_id, event_id)`; plain parameters win over `params`.
    pub fn identity(&self) -> Result<(String, String)> {
        if let (Some(device), Some(event)) = (&self.device_id, &self.event_id) {
            return Ok((device.clone(), event.clone()));
        }

        let raw = self
            .params
            .as_deref()
            .ok_or_else(|| ClipRelayError::InvalidRequest("missing deviceId/eventId".into()))?;
        let params: ClipParams = serde_json::from_str(raw)
            .map_err(|e| ClipRelayError::InvalidRequest(format!("invalid params: {e}")))?;
        Ok((params.device_id, params.event_id))
    }
}
