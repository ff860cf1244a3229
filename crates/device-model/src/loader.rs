use crate::types::DeviceModel;
use anyhow::Context;
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Device models keyed by model name (the yaml file stem).
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    pub models: HashMap<String, DeviceModel>,
}

impl ModelRegistry {
    pub fn insert(&mut self, name: impl Into<String>, model: DeviceModel) {
        self.models.insert(name.into(), model);
    }

    pub fn get(&self, name: &str) -> Option<&DeviceModel> {
        self.models.get(name)
    }
}

pub fn load_model_file(path: impl AsRef<Path>) -> anyhow::Result<DeviceModel> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading model: {}", path.display()))?;
    let val: Value =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    let model: DeviceModel = serde_yaml::from_value(val)
        .with_context(|| format!("decoding model: {}", path.display()))?;
    Ok(model)
}

pub fn load_models_dir(dir: impl AsRef<Path>) -> anyhow::Result<ModelRegistry> {
    let mut reg = ModelRegistry::default();
    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let path = entry.path();
        if let Some(ext) = path.extension() {
            if ext == "yml" || ext == "yaml" {
                entries.push(path);
            }
        }
    }
    entries.sort();
    for p in entries {
        let name = p
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .with_context(|| format!("model file name not utf-8: {}", p.display()))?;
        let model = load_model_file(&p)?;
        reg.insert(name, model);
    }
    Ok(reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Access;
    use std::io::Write;

    const SERVO_YAML: &str = r#"
registers:
  model_number:
    address: 0
    size: 2
    default: 12
  goal_position:
    address: 30
    size: 2
    access: read_write
    default: 512
    maxim: 1023
    conversion:
      kind: linear
      factor: 3.41
      offset: 512.0
  goal_position_deg:
    address: 30
    size: 2
    access: read_write
    default: 512
    maxim: 1023
    clone_of: goal_position
"#;

    #[test]
    fn test_load_model_file() {
        let dir = std::env::temp_dir().join("device-model-loader-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("servo.yml");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(SERVO_YAML.as_bytes()).unwrap();

        let model = load_model_file(&path).unwrap();
        assert_eq!(model.registers.len(), 3);
        let goal = &model.registers["goal_position"];
        assert_eq!(goal.address, 30);
        assert_eq!(goal.access, Access::ReadWrite);
        assert_eq!(
            model.registers["goal_position_deg"].clone_of.as_deref(),
            Some("goal_position")
        );

        let reg = load_models_dir(&dir).unwrap();
        assert!(reg.get("servo").is_some());
    }

    #[test]
    fn test_missing_file_is_contextual_error() {
        let err = load_model_file("/nonexistent/servo.yml").unwrap_err();
        assert!(err.to_string().contains("reading model"));
    }
}
