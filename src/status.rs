use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Environment facts the planner may use to phrase instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub airplane_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub locale: String,
    /// Seconds since the Unix epoch.
    pub local_time: u64,
}

impl DeviceStatus {
    /// Compact JSON, as carried in the planner request.
    pub fn serialize_compact(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

pub trait StatusProvider: Send + Sync {
    fn current(&self) -> DeviceStatus;
}

/// Reports only locale and clock; for hosts without battery or radio listeners.
#[derive(Debug, Clone)]
pub struct ClockStatus {
    pub locale: String,
}

impl StatusProvider for ClockStatus {
    fn current(&self) -> DeviceStatus {
        let local_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        DeviceStatus {
            locale: self.locale.clone(),
            local_time,
            ..Default::default()
        }
    }
}
