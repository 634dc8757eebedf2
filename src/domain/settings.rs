use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::service::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
    /// Level for the connection, scanner and session targets; `level` when unset.
    #[serde(default)]
    pub bluetooth_level: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
            bluetooth_level: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_session".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// The service/characteristic pair and the session's timing bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_retry_capacity")]
    pub retry_capacity: usize,
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_operation_timeout_ms(),
            write_timeout_ms: default_operation_timeout_ms(),
            retry_capacity: default_retry_capacity(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

impl SessionSettings {
    /// Resolve UUID strings and millisecond fields into a runtime config.
    pub fn to_config(&self) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            service_uuid: protocol::parse_uuid(&self.service_uuid)?,
            characteristic_uuid: protocol::parse_uuid(&self.characteristic_uuid)?,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            retry_capacity: self.retry_capacity.max(1),
            notification_buffer: self.notification_buffer.max(1),
        })
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID_SHORT.to_string()
}
fn default_characteristic_uuid() -> String {
    protocol::CHARACTERISTIC_UUID_SHORT.to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_operation_timeout_ms() -> u64 {
    5_000
}
fn default_retry_capacity() -> usize {
    4
}
fn default_notification_buffer() -> usize {
    16
}

/// Parameters of the simulated peripheral used by the demo binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "default_peripheral_name")]
    pub peripheral_name: String,
    #[serde(default = "default_initial_value")]
    pub initial_value: String,
    #[serde(default = "default_notify_interval_ms")]
    pub notify_interval_ms: u64,
    #[serde(default = "default_power_on_delay_ms")]
    pub power_on_delay_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            peripheral_name: default_peripheral_name(),
            initial_value: default_initial_value(),
            notify_interval_ms: default_notify_interval_ms(),
            power_on_delay_ms: default_power_on_delay_ms(),
        }
    }
}

fn default_peripheral_name() -> String {
    "Ble-Demo".to_string()
}
fn default_initial_value() -> String {
    "hello".to_string()
}
fn default_notify_interval_ms() -> u64 {
    2_000
}
fn default_power_on_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub session: SessionSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub simulation: SimulationSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleSession");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }
}
