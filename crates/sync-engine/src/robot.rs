use crate::config::{BusKind, GroupConfig, RobotConfig};
use crate::error::{ConfigError, Result};
use crate::joint::{Joint, JointChannel};
use crate::looper::{spawn, LoopHandle, LoopRate, LoopTask, DEFAULT_PATIENCE};
use crate::manager::{CommandSink, JointManager};
use crate::sync::{
    BulkReadSync, BulkWriteSync, MultiReadSync, MultiWriteSync, ReadSync, SyncClass, SyncGroup,
    WriteSync,
};
use bus_transport::{MockBus, SharedBus};
use device_model::{Device, ModelRegistry};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

struct SyncDef {
    name: String,
    class: SyncClass,
    devices: Vec<Arc<Device>>,
    registers: Vec<String>,
    rate: LoopRate,
    auto_start: bool,
}

struct ManagerDef {
    rate: LoopRate,
    auto_start: bool,
}

// lets the robot keep the manager (and its sink) across start/stop cycles
struct ManagerTask(Arc<JointManager>);

impl LoopTask for ManagerTask {
    fn tick(&mut self) -> Result<()> {
        self.0.process();
        Ok(())
    }
}

/// A fully assembled robot: buses, devices, joints, sync loop definitions
/// and the optional joint manager, built and cross-checked from a
/// [`RobotConfig`] before anything touches a wire.
pub struct Robot {
    name: String,
    buses: HashMap<String, Arc<SharedBus>>,
    devices: HashMap<String, Arc<Device>>,
    joints: HashMap<String, Arc<Joint>>,
    syncs: Vec<SyncDef>,
    manager: Option<(Arc<JointManager>, ManagerDef)>,
    handles: Vec<LoopHandle>,
}

impl Robot {
    /// Build the robot from its config and a model registry. Every name
    /// reference is resolved here; a bad description never gets as far as
    /// opening a bus or spawning a thread.
    pub fn from_config(cfg: &RobotConfig, models: &ModelRegistry) -> Result<Self, ConfigError> {
        let mut buses = HashMap::new();
        for (bus_name, bus_cfg) in &cfg.buses {
            let backend = match bus_cfg.kind {
                BusKind::Mock => Box::new(MockBus::new()),
            };
            buses.insert(
                bus_name.clone(),
                Arc::new(SharedBus::new(
                    bus_name.clone(),
                    backend,
                    Duration::from_millis(bus_cfg.timeout_ms),
                )),
            );
        }

        let mut devices = HashMap::new();
        for (dev_name, dev_cfg) in &cfg.devices {
            let bus = buses.get(&dev_cfg.bus).ok_or_else(|| ConfigError::Unknown {
                kind: "bus",
                name: dev_cfg.bus.clone(),
            })?;
            let model = models
                .get(&dev_cfg.model)
                .ok_or_else(|| ConfigError::Unknown {
                    kind: "model",
                    name: dev_cfg.model.clone(),
                })?;
            let device = Device::new(dev_name.clone(), dev_cfg.dev_id, Arc::clone(bus), model)?;
            devices.insert(dev_name.clone(), Arc::new(device));
        }

        let mut joints = HashMap::new();
        for (joint_name, joint_cfg) in &cfg.joints {
            let device = devices
                .get(&joint_cfg.device)
                .ok_or_else(|| ConfigError::Unknown {
                    kind: "device",
                    name: joint_cfg.device.clone(),
                })?;
            let channel = |read: &Option<String>, write: &Option<String>| {
                read.as_ref().map(|r| JointChannel {
                    read: r.clone(),
                    write: write.clone(),
                })
            };
            let joint = Joint::new(
                joint_name.clone(),
                Arc::clone(device),
                JointChannel {
                    read: joint_cfg.position_read.clone(),
                    write: joint_cfg.position_write.clone(),
                },
                channel(&joint_cfg.velocity_read, &joint_cfg.velocity_write),
                channel(&joint_cfg.load_read, &joint_cfg.load_write),
                joint_cfg.inverse,
                joint_cfg.offset,
                joint_cfg.minim,
                joint_cfg.maxim,
                joint_cfg.activate.clone(),
                joint_cfg.auto_activate,
            )?;
            joints.insert(joint_name.clone(), Arc::new(joint));
        }

        let mut syncs = Vec::new();
        let mut sync_names: Vec<&String> = cfg.syncs.keys().collect();
        sync_names.sort();
        for sync_name in sync_names {
            let sync_cfg = &cfg.syncs[sync_name];
            let members = resolve_group(&sync_cfg.group, cfg, &devices, &joints)?;
            let sync_devices: Vec<Arc<Device>> = members
                .iter()
                .map(|dev_name| Arc::clone(&devices[dev_name]))
                .collect();
            if !(sync_cfg.frequency > 0.0) {
                return Err(ConfigError::BadFrequency(sync_name.clone()));
            }
            let def = SyncDef {
                name: sync_name.clone(),
                class: sync_cfg.class,
                devices: sync_devices,
                registers: sync_cfg.registers.clone(),
                rate: LoopRate {
                    frequency: sync_cfg.frequency,
                    warning_ratio: sync_cfg.warning,
                    review: Duration::from_secs_f64(sync_cfg.review),
                },
                auto_start: sync_cfg.auto_start,
            };
            // dry-build once so layout and access problems surface now,
            // not at start time
            build_task(&def).map(drop)?;
            syncs.push(def);
        }

        let manager = match &cfg.joint_manager {
            None => None,
            Some(mgr_cfg) => {
                if !(mgr_cfg.frequency > 0.0) {
                    return Err(ConfigError::BadFrequency("joint_manager".into()));
                }
                let mut managed = Vec::new();
                for joint_name in &mgr_cfg.joints {
                    let joint = joints.get(joint_name).ok_or_else(|| ConfigError::Unknown {
                        kind: "joint",
                        name: joint_name.clone(),
                    })?;
                    managed.push(Arc::clone(joint));
                }
                let manager = Arc::new(JointManager::new(managed, mgr_cfg.reductions));
                let def = ManagerDef {
                    rate: LoopRate::new(mgr_cfg.frequency),
                    auto_start: mgr_cfg.auto_start,
                };
                Some((manager, def))
            }
        };

        Ok(Self {
            name: cfg.name.clone().unwrap_or_else(|| "robot".to_string()),
            buses,
            devices,
            joints,
            syncs,
            manager,
            handles: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.get(name)
    }

    pub fn joint(&self, name: &str) -> Option<&Arc<Joint>> {
        self.joints.get(name)
    }

    pub fn bus(&self, name: &str) -> Option<&Arc<SharedBus>> {
        self.buses.get(name)
    }

    /// Submission handle for the joint manager, when one is configured.
    /// Valid across start/stop cycles.
    pub fn command_sink(&self) -> Option<CommandSink> {
        self.manager.as_ref().map(|(mgr, _)| mgr.sink())
    }

    pub fn loop_handles(&self) -> &[LoopHandle] {
        &self.handles
    }

    pub fn is_started(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Bring the robot up: open buses, open devices, activate the
    /// auto-activate joints, then start the auto-start syncs and the
    /// manager. Already-started robots are left alone.
    pub fn start(&mut self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        for bus in self.buses.values() {
            if !bus.is_open() {
                bus.open()?;
            }
        }
        for device in self.devices.values() {
            if !device.is_open() {
                device.open()?;
            }
        }
        for joint in self.joints.values() {
            if joint.auto_activate() {
                joint.activate()?;
            }
        }
        for def in &self.syncs {
            if def.auto_start {
                let handle = spawn_sync(def)?;
                self.handles.push(handle);
            }
        }
        if let Some((manager, def)) = &self.manager {
            if def.auto_start {
                let handle = spawn(
                    "joint_manager",
                    ManagerTask(Arc::clone(manager)),
                    def.rate,
                    DEFAULT_PATIENCE,
                )?;
                self.handles.push(handle);
            }
        }
        info!(robot = %self.name, loops = self.handles.len(), "robot started");
        Ok(())
    }

    /// Take the robot down in reverse order: stop and join every loop,
    /// deactivate joints, close devices, close buses. Safe to call twice.
    pub fn stop(&mut self) {
        for mut handle in self.handles.drain(..) {
            handle.stop();
        }
        for joint in self.joints.values() {
            if joint.auto_activate() && joint.device().is_open() {
                if let Err(e) = joint.deactivate() {
                    warn!(joint = %joint.name(), "deactivate failed: {e}");
                }
            }
        }
        for device in self.devices.values() {
            if device.is_open() {
                device.close();
            }
        }
        for bus in self.buses.values() {
            if bus.is_open() {
                if let Err(e) = bus.close() {
                    warn!(bus = %bus.name(), "close failed: {e}");
                }
            }
        }
        info!(robot = %self.name, "robot stopped");
    }
}

impl std::fmt::Debug for Robot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Robot")
            .field("name", &self.name)
            .field("buses", &self.buses.len())
            .field("devices", &self.devices.len())
            .field("joints", &self.joints.len())
            .field("syncs", &self.syncs.len())
            .finish()
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resolve a group to the device names it covers. Joints contribute their
/// device; nested groups are followed with cycle detection.
fn resolve_group(
    group_name: &str,
    cfg: &RobotConfig,
    devices: &HashMap<String, Arc<Device>>,
    joints: &HashMap<String, Arc<Joint>>,
) -> Result<BTreeSet<String>, ConfigError> {
    fn walk(
        group_name: &str,
        cfg: &RobotConfig,
        devices: &HashMap<String, Arc<Device>>,
        joints: &HashMap<String, Arc<Joint>>,
        visiting: &mut HashSet<String>,
        out: &mut BTreeSet<String>,
    ) -> Result<(), ConfigError> {
        if !visiting.insert(group_name.to_string()) {
            return Err(ConfigError::GroupCycle(group_name.to_string()));
        }
        let group: &GroupConfig =
            cfg.groups
                .get(group_name)
                .ok_or_else(|| ConfigError::Unknown {
                    kind: "group",
                    name: group_name.to_string(),
                })?;
        for dev_name in &group.devices {
            if !devices.contains_key(dev_name) {
                return Err(ConfigError::Unknown {
                    kind: "device",
                    name: dev_name.clone(),
                });
            }
            out.insert(dev_name.clone());
        }
        for joint_name in &group.joints {
            let joint = joints.get(joint_name).ok_or_else(|| ConfigError::Unknown {
                kind: "joint",
                name: joint_name.clone(),
            })?;
            out.insert(joint.device().name().to_string());
        }
        for nested in &group.groups {
            walk(nested, cfg, devices, joints, visiting, out)?;
        }
        visiting.remove(group_name);
        Ok(())
    }

    let mut out = BTreeSet::new();
    let mut visiting = HashSet::new();
    walk(group_name, cfg, devices, joints, &mut visiting, &mut out)?;
    Ok(out)
}

enum SyncTask {
    Read(ReadSync),
    Write(WriteSync),
    BulkRead(BulkReadSync),
    BulkWrite(BulkWriteSync),
    MultiRead(MultiReadSync),
    MultiWrite(MultiWriteSync),
}

fn build_task(def: &SyncDef) -> Result<SyncTask, ConfigError> {
    let group = SyncGroup::new(
        def.name.clone(),
        def.devices.clone(),
        def.registers.clone(),
        def.class.is_write(),
    )?;
    Ok(match def.class {
        SyncClass::Read => SyncTask::Read(ReadSync::new(group)),
        SyncClass::Write => SyncTask::Write(WriteSync::new(group)),
        SyncClass::BulkRead => SyncTask::BulkRead(BulkReadSync::new(group)),
        SyncClass::BulkWrite => SyncTask::BulkWrite(BulkWriteSync::new(group)?),
        SyncClass::MultiRead => SyncTask::MultiRead(MultiReadSync::new(group)?),
        SyncClass::MultiWrite => SyncTask::MultiWrite(MultiWriteSync::new(group)?),
    })
}

fn spawn_sync(def: &SyncDef) -> Result<LoopHandle> {
    match build_task(def)? {
        SyncTask::Read(t) => spawn(def.name.clone(), t, def.rate, DEFAULT_PATIENCE),
        SyncTask::Write(t) => spawn(def.name.clone(), t, def.rate, DEFAULT_PATIENCE),
        SyncTask::BulkRead(t) => spawn(def.name.clone(), t, def.rate, DEFAULT_PATIENCE),
        SyncTask::BulkWrite(t) => spawn(def.name.clone(), t, def.rate, DEFAULT_PATIENCE),
        SyncTask::MultiRead(t) => spawn(def.name.clone(), t, def.rate, DEFAULT_PATIENCE),
        SyncTask::MultiWrite(t) => spawn(def.name.clone(), t, def.rate, DEFAULT_PATIENCE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_robot_config;
    use device_model::{DeviceModel, Value};
    use std::thread;

    const SERVO_MODEL: &str = r#"
registers:
  present_position:
    address: 10
    size: 2
    maxim: 1023
  present_load:
    address: 14
    size: 2
  goal_position:
    address: 30
    size: 2
    access: read_write
    maxim: 1023
  torque_enable:
    address: 24
    size: 1
    access: read_write
    conversion:
      kind: bool
"#;

    const ROBOT_YAML: &str = r#"
name: pan_tilt
buses:
  mock0: { timeout_ms: 100 }
devices:
  servo1: { bus: mock0, dev_id: 1, model: servo }
  servo2: { bus: mock0, dev_id: 2, model: servo }
joints:
  pan:
    device: servo1
    position_read: present_position
    position_write: goal_position
    activate: torque_enable
    auto_activate: true
  tilt:
    device: servo2
    position_read: present_position
    position_write: goal_position
groups:
  servos: { devices: [servo1], joints: [tilt] }
syncs:
  read_state:
    class: bulk_read
    group: servos
    registers: [present_position, present_load]
    frequency: 100.0
    review: 0.2
joint_manager:
  joints: [pan, tilt]
  frequency: 50.0
"#;

    fn registry() -> ModelRegistry {
        let model: DeviceModel = serde_yaml::from_str(SERVO_MODEL).unwrap();
        let mut reg = ModelRegistry::default();
        reg.insert("servo", model);
        reg
    }

    fn config() -> RobotConfig {
        serde_yaml::from_str(ROBOT_YAML).unwrap()
    }

    #[test]
    fn test_assembly_resolves_all_names() {
        let robot = Robot::from_config(&config(), &registry()).unwrap();
        assert_eq!(robot.name(), "pan_tilt");
        assert!(robot.device("servo1").is_some());
        assert!(robot.joint("tilt").is_some());
        assert!(robot.command_sink().is_some());
    }

    #[test]
    fn test_assembly_rejects_unknown_model() {
        let mut cfg = config();
        cfg.devices.get_mut("servo1").unwrap().model = "missing".into();
        let err = Robot::from_config(&cfg, &registry()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Unknown { kind: "model", .. }
        ));
    }

    #[test]
    fn test_assembly_rejects_unknown_group_member() {
        let mut cfg = config();
        cfg.groups.get_mut("servos").unwrap().devices.push("ghost".into());
        let err = Robot::from_config(&cfg, &registry()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Unknown { kind: "device", .. }
        ));
    }

    #[test]
    fn test_assembly_rejects_write_sync_on_read_only() {
        let mut cfg = config();
        cfg.syncs.get_mut("read_state").unwrap().class = SyncClass::Write;
        let err = Robot::from_config(&cfg, &registry()).unwrap_err();
        assert!(matches!(err, ConfigError::NotWritable { .. }));
    }

    #[test]
    fn test_group_cycle_detected() {
        let mut cfg = config();
        cfg.groups.insert(
            "a".into(),
            GroupConfig {
                groups: vec!["b".into()],
                ..GroupConfig::default()
            },
        );
        cfg.groups.insert(
            "b".into(),
            GroupConfig {
                groups: vec!["a".into()],
                ..GroupConfig::default()
            },
        );
        cfg.syncs.get_mut("read_state").unwrap().group = "a".into();
        let err = Robot::from_config(&cfg, &registry()).unwrap_err();
        assert!(matches!(err, ConfigError::GroupCycle(_)));
    }

    #[test]
    fn test_start_and_stop_lifecycle() {
        let mut robot = Robot::from_config(&config(), &registry()).unwrap();
        robot.start().unwrap();
        assert!(robot.is_started());
        // bulk read + manager loops
        assert_eq!(robot.loop_handles().len(), 2);
        assert!(robot.joint("pan").unwrap().is_active().unwrap());

        let sink = robot.command_sink().unwrap();
        sink.submit(
            "test",
            &[("pan".to_string(), crate::joint::JointCommand::position(200.0))],
        );
        thread::sleep(Duration::from_millis(120));
        let goal = robot
            .device("servo1")
            .unwrap()
            .read("goal_position")
            .unwrap();
        assert_eq!(goal, Value::F64(200.0));

        robot.stop();
        assert!(!robot.is_started());
        // second stop is a no-op
        robot.stop();
    }

    #[test]
    fn test_config_loader_reports_missing_file() {
        let err = load_robot_config("/nonexistent/robot.yml").unwrap_err();
        assert!(err.to_string().contains("reading robot"));
    }
}
