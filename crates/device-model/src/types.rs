use crate::value::{ByteOrder, Conversion};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Register access mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Declarative description of one register, as written in a device model
/// file. Bounds are in internal format; `maxim` defaults to the full range
/// of the register (`2^(8*size) - 1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub address: u16,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub access: Access,
    #[serde(default)]
    pub order: ByteOrder,
    #[serde(default)]
    pub default: u32,
    #[serde(default)]
    pub minim: u32,
    #[serde(default)]
    pub maxim: Option<u32>,
    #[serde(default)]
    pub conversion: Conversion,
    /// Name of the register this one is a clone view of. A clone presents
    /// its own conversion over the base register's cached bytes at the same
    /// address.
    #[serde(default)]
    pub clone_of: Option<String>,
}

fn default_size() -> usize {
    1
}

impl RegisterSpec {
    /// Upper internal bound, defaulted from the register width.
    pub fn effective_maxim(&self) -> u32 {
        match self.maxim {
            Some(m) => m,
            None => match self.size {
                4 => u32::MAX,
                s => (1u32 << (8 * s)) - 1,
            },
        }
    }
}

/// A device model: the named register map a device is instantiated from.
/// Loaded from YAML, one file per model (see [`crate::loader`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceModel {
    #[serde(default)]
    pub registers: HashMap<String, RegisterSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::BoolMode;

    #[test]
    fn test_effective_maxim_defaults_by_size() {
        let mut spec = RegisterSpec {
            address: 0,
            size: 1,
            access: Access::ReadOnly,
            order: ByteOrder::LittleEndian,
            default: 0,
            minim: 0,
            maxim: None,
            conversion: Conversion::Identity,
            clone_of: None,
        };
        assert_eq!(spec.effective_maxim(), 255);
        spec.size = 2;
        assert_eq!(spec.effective_maxim(), 65_535);
        spec.size = 4;
        assert_eq!(spec.effective_maxim(), u32::MAX);
        spec.maxim = Some(1023);
        assert_eq!(spec.effective_maxim(), 1023);
    }

    #[test]
    fn test_register_spec_from_yaml() {
        let yaml = r#"
address: 30
size: 2
access: read_write
maxim: 1023
conversion:
  kind: linear
  factor: 3.41
  offset: 512
"#;
        let spec: RegisterSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.address, 30);
        assert_eq!(spec.size, 2);
        assert_eq!(spec.access, Access::ReadWrite);
        assert!(matches!(spec.conversion, Conversion::Linear { .. }));
    }

    #[test]
    fn test_bool_register_spec_from_yaml() {
        let yaml = r#"
address: 18
conversion:
  kind: bool
  bits: 0b_invalid
"#;
        // invalid bits literal must fail loudly, not default
        assert!(serde_yaml::from_str::<RegisterSpec>(yaml).is_err());

        let yaml = r#"
address: 18
conversion:
  kind: bool
  bits: 6
  mode: all
"#;
        let spec: RegisterSpec = serde_yaml::from_str(yaml).unwrap();
        match spec.conversion {
            Conversion::Bool { bits, mode, .. } => {
                assert_eq!(bits, Some(6));
                assert_eq!(mode, BoolMode::All);
            }
            other => panic!("unexpected conversion {other:?}"),
        }
    }
}
