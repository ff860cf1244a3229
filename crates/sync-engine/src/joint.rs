use crate::error::Result;
use device_model::{Device, DeviceError, Value};
use std::sync::Arc;
use tracing::warn;

/// One commanded sample for a joint. `None` means the attribute is not
/// commanded and must be left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JointCommand {
    pub position: Option<f64>,
    pub velocity: Option<f64>,
    pub load: Option<f64>,
}

impl JointCommand {
    pub fn position(position: f64) -> Self {
        Self {
            position: Some(position),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.velocity.is_none() && self.load.is_none()
    }
}

/// Registers a joint attribute maps onto: where to read the measured value
/// and, for commandable attributes, where to write the desired one.
#[derive(Debug, Clone)]
pub struct JointChannel {
    pub read: String,
    pub write: Option<String>,
}

/// A joint-space view over one device.
///
/// Joint space applies `inverse` then `offset` on top of the registers'
/// external values: `joint = offset - external` when inverse, otherwise
/// `joint = offset + external`. Desired positions are clamped to the joint
/// limits before the transform is undone; desired velocity and load are
/// magnitudes, written as absolute values.
pub struct Joint {
    name: String,
    device: Arc<Device>,
    position: JointChannel,
    velocity: Option<JointChannel>,
    load: Option<JointChannel>,
    inverse: bool,
    offset: f64,
    minim: Option<f64>,
    maxim: Option<f64>,
    activate_register: Option<String>,
    auto_activate: bool,
}

impl Joint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        device: Arc<Device>,
        position: JointChannel,
        velocity: Option<JointChannel>,
        load: Option<JointChannel>,
        inverse: bool,
        offset: f64,
        minim: Option<f64>,
        maxim: Option<f64>,
        activate_register: Option<String>,
        auto_activate: bool,
    ) -> Result<Self, DeviceError> {
        // every named register must exist up front
        let mut names: Vec<&String> = vec![&position.read];
        names.extend(position.write.iter());
        for ch in velocity.iter().chain(load.iter()) {
            names.push(&ch.read);
            names.extend(ch.write.iter());
        }
        names.extend(activate_register.iter());
        for reg_name in names {
            device.register(reg_name)?;
        }
        if let Some(reg_name) = &activate_register {
            let reg = device.register(reg_name)?;
            if !reg.spec().conversion.is_bool() {
                return Err(DeviceError::BadModel(format!(
                    "activation register '{reg_name}' is not boolean"
                )));
            }
        }
        Ok(Self {
            name: name.into(),
            device,
            position,
            velocity,
            load,
            inverse,
            offset,
            minim,
            maxim,
            activate_register,
            auto_activate,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn auto_activate(&self) -> bool {
        self.auto_activate
    }

    fn to_joint_space(&self, external: f64) -> f64 {
        if self.inverse {
            self.offset - external
        } else {
            self.offset + external
        }
    }

    fn from_joint_space(&self, joint: f64) -> f64 {
        let clamped = match (self.minim, self.maxim) {
            (Some(lo), _) if joint < lo => lo,
            (_, Some(hi)) if joint > hi => hi,
            _ => joint,
        };
        if self.inverse {
            self.offset - clamped
        } else {
            clamped - self.offset
        }
    }

    fn read_channel(&self, channel: &JointChannel) -> Result<f64> {
        let value = self.device.read(&channel.read)?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    fn write_channel(&self, channel: &JointChannel, external: f64) -> Result<()> {
        match &channel.write {
            Some(reg_name) => {
                self.device.write(reg_name, Value::F64(external))?;
                Ok(())
            }
            None => {
                warn!(joint = %self.name, "attribute has no write register; command dropped");
                Ok(())
            }
        }
    }

    pub fn position(&self) -> Result<f64> {
        let external = self.read_channel(&self.position)?;
        Ok(self.to_joint_space(external))
    }

    pub fn set_position(&self, position: f64) -> Result<()> {
        let external = self.from_joint_space(position);
        let channel = self.position.clone();
        self.write_channel(&channel, external)
    }

    pub fn velocity(&self) -> Result<Option<f64>> {
        match &self.velocity {
            Some(ch) => Ok(Some(self.read_channel(ch)?)),
            None => Ok(None),
        }
    }

    /// Desired velocity is a magnitude: direction belongs to position.
    pub fn set_velocity(&self, velocity: f64) -> Result<()> {
        match self.velocity.clone() {
            Some(ch) => self.write_channel(&ch, velocity.abs()),
            None => Ok(()),
        }
    }

    pub fn load(&self) -> Result<Option<f64>> {
        match &self.load {
            Some(ch) => Ok(Some(self.read_channel(ch)?)),
            None => Ok(None),
        }
    }

    pub fn set_load(&self, load: f64) -> Result<()> {
        match self.load.clone() {
            Some(ch) => self.write_channel(&ch, load.abs()),
            None => Ok(()),
        }
    }

    pub fn is_active(&self) -> Result<bool> {
        match &self.activate_register {
            Some(reg_name) => {
                let v = self.device.read(reg_name)?;
                Ok(v.as_bool().unwrap_or(false))
            }
            None => Ok(true),
        }
    }

    pub fn activate(&self) -> Result<()> {
        self.set_active(true)
    }

    pub fn deactivate(&self) -> Result<()> {
        self.set_active(false)
    }

    fn set_active(&self, active: bool) -> Result<()> {
        if let Some(reg_name) = &self.activate_register {
            self.device.write(reg_name, Value::Bool(active))?;
        }
        Ok(())
    }

    /// Apply one reduced command, attribute by attribute. Failures are
    /// logged per attribute and do not block the others.
    pub fn apply(&self, command: &JointCommand) {
        if let Some(p) = command.position {
            if let Err(e) = self.set_position(p) {
                warn!(joint = %self.name, "position command failed: {e}");
            }
        }
        if let Some(v) = command.velocity {
            if let Err(e) = self.set_velocity(v) {
                warn!(joint = %self.name, "velocity command failed: {e}");
            }
        }
        if let Some(l) = command.load {
            if let Err(e) = self.set_load(l) {
                warn!(joint = %self.name, "load command failed: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Joint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Joint")
            .field("name", &self.name)
            .field("device", &self.device.name())
            .field("inverse", &self.inverse)
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_transport::{MockBus, SharedBus};
    use device_model::{Access, ByteOrder, Conversion, DeviceModel, RegisterSpec};
    use std::collections::HashMap;
    use std::time::Duration;

    fn model() -> DeviceModel {
        let mut registers = HashMap::new();
        let linear = Conversion::Linear {
            factor: 1.0,
            offset: 0.0,
            sign_bit: None,
        };
        registers.insert(
            "present_position".to_string(),
            RegisterSpec {
                address: 10,
                size: 2,
                access: Access::ReadOnly,
                order: ByteOrder::LittleEndian,
                default: 0,
                minim: 0,
                maxim: Some(1023),
                conversion: linear.clone(),
                clone_of: None,
            },
        );
        registers.insert(
            "goal_position".to_string(),
            RegisterSpec {
                address: 30,
                size: 2,
                access: Access::ReadWrite,
                order: ByteOrder::LittleEndian,
                default: 0,
                minim: 0,
                maxim: Some(1023),
                conversion: linear.clone(),
                clone_of: None,
            },
        );
        registers.insert(
            "goal_speed".to_string(),
            RegisterSpec {
                address: 32,
                size: 2,
                access: Access::ReadWrite,
                order: ByteOrder::LittleEndian,
                default: 0,
                minim: 0,
                maxim: Some(1023),
                conversion: linear,
                clone_of: None,
            },
        );
        registers.insert(
            "torque_enable".to_string(),
            RegisterSpec {
                address: 24,
                size: 1,
                access: Access::ReadWrite,
                order: ByteOrder::LittleEndian,
                default: 0,
                minim: 0,
                maxim: None,
                conversion: Conversion::Bool {
                    bits: None,
                    mode: device_model::BoolMode::Any,
                    mask: None,
                },
                clone_of: None,
            },
        );
        DeviceModel { registers }
    }

    fn joint(inverse: bool, offset: f64, limits: (Option<f64>, Option<f64>)) -> Joint {
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        bus.open().unwrap();
        let device = Device::new("servo1", 1, bus, &model()).unwrap();
        device.open().unwrap();
        Joint::new(
            "pan",
            Arc::new(device),
            JointChannel {
                read: "present_position".to_string(),
                write: Some("goal_position".to_string()),
            },
            Some(JointChannel {
                read: "goal_speed".to_string(),
                write: Some("goal_speed".to_string()),
            }),
            None,
            inverse,
            offset,
            limits.0,
            limits.1,
            Some("torque_enable".to_string()),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_inverse_and_offset_on_read() {
        let j = joint(true, 100.0, (None, None));
        j.device().set_raw_value("present_position", 30).unwrap();
        j.device().claim("present_position", 7).unwrap(); // cache-backed
        assert_eq!(j.position().unwrap(), 70.0);
    }

    #[test]
    fn test_write_clamps_to_joint_limits() {
        let j = joint(false, 0.0, (Some(0.0), Some(500.0)));
        j.set_position(900.0).unwrap();
        assert_eq!(j.device().raw_value("goal_position").unwrap(), 500);
    }

    #[test]
    fn test_write_undoes_offset_and_inverse() {
        let j = joint(true, 100.0, (None, None));
        j.set_position(70.0).unwrap();
        assert_eq!(j.device().raw_value("goal_position").unwrap(), 30);
    }

    #[test]
    fn test_velocity_written_as_magnitude() {
        let j = joint(false, 0.0, (None, None));
        j.set_velocity(-40.0).unwrap();
        assert_eq!(j.device().raw_value("goal_speed").unwrap(), 40);
    }

    #[test]
    fn test_activation_round_trip() {
        let j = joint(false, 0.0, (None, None));
        j.activate().unwrap();
        assert!(j.is_active().unwrap());
        j.deactivate().unwrap();
        assert!(!j.is_active().unwrap());
    }

    #[test]
    fn test_non_boolean_activation_register_rejected() {
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        let device = Arc::new(Device::new("servo1", 1, bus, &model()).unwrap());
        let err = Joint::new(
            "pan",
            device,
            JointChannel {
                read: "present_position".to_string(),
                write: None,
            },
            None,
            None,
            false,
            0.0,
            None,
            None,
            Some("goal_speed".to_string()),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::BadModel(_)));
    }

    #[test]
    fn test_unknown_register_rejected_at_construction() {
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        let device = Arc::new(Device::new("servo1", 1, bus, &model()).unwrap());
        let err = Joint::new(
            "pan",
            device,
            JointChannel {
                read: "bogus".to_string(),
                write: None,
            },
            None,
            None,
            false,
            0.0,
            None,
            None,
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::UnknownRegister { .. }));
    }
}
