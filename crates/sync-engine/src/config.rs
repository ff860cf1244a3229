use crate::manager::Reductions;
use crate::sync::SyncClass;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Top-level robot description, loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub buses: HashMap<String, BusConfig>,
    pub devices: HashMap<String, DeviceConfig>,
    #[serde(default)]
    pub joints: HashMap<String, JointConfig>,
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
    #[serde(default)]
    pub syncs: HashMap<String, SyncConfig>,
    #[serde(default)]
    pub joint_manager: Option<ManagerConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// In-memory mock backend. Real wire drivers plug in here later.
    #[default]
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,
    /// Acquire timeout for the shared-access gate, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub bus: String,
    pub dev_id: u8,
    /// Model name: the file stem of a register map in the models directory.
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointConfig {
    pub device: String,
    pub position_read: String,
    #[serde(default)]
    pub position_write: Option<String>,
    #[serde(default)]
    pub velocity_read: Option<String>,
    #[serde(default)]
    pub velocity_write: Option<String>,
    #[serde(default)]
    pub load_read: Option<String>,
    #[serde(default)]
    pub load_write: Option<String>,
    #[serde(default)]
    pub inverse: bool,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub minim: Option<f64>,
    #[serde(default)]
    pub maxim: Option<f64>,
    #[serde(default)]
    pub activate: Option<String>,
    #[serde(default)]
    pub auto_activate: bool,
}

/// A named collection of devices. Members can be devices, joints (which
/// contribute their device) or other groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub joints: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub class: SyncClass,
    pub group: String,
    pub registers: Vec<String>,
    pub frequency: f64,
    #[serde(default = "default_warning_ratio")]
    pub warning: f64,
    #[serde(default = "default_review_secs")]
    pub review: f64,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub joints: Vec<String>,
    pub frequency: f64,
    /// One reduction per attribute; unmentioned attributes default to mean.
    #[serde(default)]
    pub reductions: Reductions,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_warning_ratio() -> f64 {
    0.9
}

fn default_review_secs() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

pub fn load_robot_config(path: impl AsRef<Path>) -> anyhow::Result<RobotConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading robot: {}", path.display()))?;
    let cfg: RobotConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOT_YAML: &str = r#"
name: pan_tilt
buses:
  mock0:
    timeout_ms: 100
devices:
  servo1: { bus: mock0, dev_id: 1, model: servo }
  servo2: { bus: mock0, dev_id: 2, model: servo }
joints:
  pan:
    device: servo1
    position_read: present_position
    position_write: goal_position
    offset: 150.0
    auto_activate: true
groups:
  servos: { devices: [servo1, servo2] }
syncs:
  read_state:
    class: bulk_read
    group: servos
    registers: [present_position]
    frequency: 50.0
joint_manager:
  joints: [pan]
  frequency: 20.0
  reductions:
    position: max
    load: min
"#;

    #[test]
    fn test_robot_yaml_round_trip() {
        let cfg: RobotConfig = serde_yaml::from_str(ROBOT_YAML).unwrap();
        assert_eq!(cfg.name.as_deref(), Some("pan_tilt"));
        assert_eq!(cfg.buses["mock0"].timeout_ms, 100);
        assert_eq!(cfg.devices.len(), 2);
        assert!(cfg.joints["pan"].auto_activate);
        let sync = &cfg.syncs["read_state"];
        assert_eq!(sync.class, SyncClass::BulkRead);
        assert!(sync.auto_start);
        assert_eq!(sync.warning, 0.9);
        let mgr = cfg.joint_manager.unwrap();
        assert_eq!(mgr.reductions.position, crate::manager::Reduction::Max);
        assert_eq!(mgr.reductions.velocity, crate::manager::Reduction::Mean);
        assert_eq!(mgr.reductions.load, crate::manager::Reduction::Min);
    }
}
