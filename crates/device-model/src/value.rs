use serde::{Deserialize, Serialize};
use tracing::warn;

/// External (human-facing) value of a register.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    F64(f64),
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            Value::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::F64(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Byte order of a multi-byte register on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Low byte first (the common case for servo register files).
    #[default]
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Decode up to four bytes into an internal value.
    pub fn decode(&self, bytes: &[u8]) -> u32 {
        let mut value: u32 = 0;
        match self {
            ByteOrder::LittleEndian => {
                for &b in bytes.iter().rev() {
                    value = (value << 8) | u32::from(b);
                }
            }
            ByteOrder::BigEndian => {
                for &b in bytes {
                    value = (value << 8) | u32::from(b);
                }
            }
        }
        value
    }

    /// Encode an internal value into `size` wire bytes.
    pub fn encode(&self, value: u32, size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(size);
        for i in 0..size {
            out.push(((value >> (8 * i)) & 0xFF) as u8);
        }
        if *self == ByteOrder::BigEndian {
            out.reverse();
        }
        out
    }
}

/// How a bit-pattern register evaluates to a boolean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolMode {
    /// True when any configured bit is set.
    #[default]
    Any,
    /// True when every configured bit is set.
    All,
    /// True when `(value & mask) == bits` exactly.
    Pattern,
}

/// Conversion between a register's internal (wire) integer and its external
/// value. A closed set: device model files pick one of these by tag, there
/// is no runtime class registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversion {
    /// External value is the raw integer.
    #[default]
    Identity,
    /// `external = (internal - offset) / factor`. An optional sign bit
    /// (1-based bit number) marks values with that bit set as negative,
    /// two's-complement style.
    Linear {
        #[serde(default = "default_factor")]
        factor: f64,
        #[serde(default)]
        offset: f64,
        #[serde(default)]
        sign_bit: Option<u8>,
    },
    /// Internal values at or above `threshold` encode negative magnitudes:
    /// `external = (threshold - internal) / factor`. Used by devices that
    /// fold direction into the top of the register range.
    Threshold {
        #[serde(default = "default_factor")]
        factor: f64,
        threshold: u32,
    },
    /// Bit-pattern boolean view. Without `bits` the whole register is
    /// tested against zero. With `mask`, writes touch only the masked bits
    /// and preserve the rest, so sibling clone views stay intact.
    Bool {
        #[serde(default)]
        bits: Option<u32>,
        #[serde(default)]
        mode: BoolMode,
        #[serde(default)]
        mask: Option<u32>,
    },
    /// Explicit 1:1 internal-to-external table with optional mask.
    Mapping {
        pairs: Vec<MapPair>,
        #[serde(default)]
        mask: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapPair {
    pub raw: u32,
    pub value: f64,
}

fn default_factor() -> f64 {
    1.0
}

impl Conversion {
    /// Convert an internal value to the external representation. Pure.
    pub fn to_external(&self, internal: u32) -> Value {
        match self {
            Conversion::Identity => Value::F64(f64::from(internal)),
            Conversion::Linear {
                factor,
                offset,
                sign_bit,
            } => {
                let mut value = f64::from(internal);
                if let Some(bit) = sign_bit {
                    let sign_val = f64::from(2u32.pow(u32::from(*bit)));
                    if value > sign_val / 2.0 {
                        value -= sign_val;
                    }
                }
                Value::F64((value - offset) / factor)
            }
            Conversion::Threshold { factor, threshold } => {
                if internal < *threshold {
                    Value::F64(f64::from(internal) / factor)
                } else {
                    Value::F64((f64::from(*threshold) - f64::from(internal)) / factor)
                }
            }
            Conversion::Bool { bits, mode, mask } => {
                let result = match bits {
                    None => internal != 0,
                    Some(bits) => match mode {
                        BoolMode::Any => internal & bits != 0,
                        BoolMode::All => internal & bits == *bits,
                        BoolMode::Pattern => {
                            let mask = mask.unwrap_or(u32::MAX);
                            internal & mask == *bits
                        }
                    },
                };
                Value::Bool(result)
            }
            Conversion::Mapping { pairs, mask } => {
                let key = match mask {
                    Some(mask) => internal & mask,
                    None => internal,
                };
                let found = pairs.iter().find(|p| p.raw == key).map(|p| p.value);
                Value::F64(found.unwrap_or(0.0))
            }
        }
    }

    /// Convert an external value to the internal representation.
    ///
    /// `current` is the register's present internal value; masked boolean
    /// and mapping conversions modify only their own bits of it. Returns
    /// `None` when the value is not representable (wrong variant, or no
    /// mapping entry), in which case callers keep `current` unchanged.
    pub fn to_internal(&self, value: &Value, current: u32) -> Option<u32> {
        match self {
            Conversion::Identity => {
                let v = value.as_f64()?;
                Some(v.round().max(0.0) as u32)
            }
            Conversion::Linear {
                factor,
                offset,
                sign_bit,
            } => {
                let v = value.as_f64()?;
                let mut internal = (v * factor + offset).round();
                if internal < 0.0 {
                    if let Some(bit) = sign_bit {
                        internal += f64::from(2u32.pow(u32::from(*bit)));
                    }
                }
                // still-negative values saturate at zero; the caller's clip
                // then raises them to the register minimum
                Some(internal.max(0.0) as u32)
            }
            Conversion::Threshold { factor, threshold } => {
                let v = value.as_f64()?;
                if v >= 0.0 {
                    Some((v * factor).round() as u32)
                } else {
                    Some((((-v) * factor).round() as u32).saturating_add(*threshold))
                }
            }
            Conversion::Bool { bits, mask, .. } => {
                let b = value.as_bool()?;
                let internal = match mask {
                    None => {
                        if !b {
                            0
                        } else {
                            bits.unwrap_or(1)
                        }
                    }
                    Some(mask) => {
                        // touch only our masked bits; the rest of the
                        // register may belong to sibling clone views
                        let preserved = current & !mask;
                        if b {
                            preserved | bits.unwrap_or(*mask)
                        } else {
                            preserved
                        }
                    }
                };
                Some(internal)
            }
            Conversion::Mapping { pairs, mask } => {
                let v = value.as_f64()?;
                let raw = pairs.iter().find(|p| p.value == v).map(|p| p.raw);
                let raw = match raw {
                    Some(raw) => raw,
                    None => {
                        warn!("no mapping entry for external value {v}; keeping current");
                        return None;
                    }
                };
                match mask {
                    Some(mask) => Some((current & !mask) | (raw & mask)),
                    None => Some(raw),
                }
            }
        }
    }

    /// Whether the external side of this conversion is boolean.
    pub fn is_bool(&self) -> bool {
        matches!(self, Conversion::Bool { .. })
    }
}
