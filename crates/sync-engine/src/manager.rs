use crate::error::Result;
use crate::joint::{Joint, JointCommand};
use crate::looper::LoopTask;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// How concurrent commands for the same joint attribute are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Mean,
    Max,
    Min,
}

/// Per-attribute reduction choices for one manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reductions {
    #[serde(default)]
    pub position: Reduction,
    #[serde(default)]
    pub velocity: Reduction,
    #[serde(default)]
    pub load: Reduction,
}

impl Reduction {
    fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        Some(match self {
            Reduction::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reduction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reduction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        })
    }
}

#[derive(Default)]
struct ManagerState {
    // source -> joint -> latest command from that source
    pending: HashMap<String, HashMap<String, JointCommand>>,
    stopped: HashSet<String>,
}

/// Submission handle for command sources. Cheap to clone and safe to use
/// from any thread; `submit` never blocks on the manager's tick.
#[derive(Clone)]
pub struct CommandSink {
    state: Arc<Mutex<ManagerState>>,
}

impl CommandSink {
    /// Merge commands from `source` into the pending set. A later submit
    /// from the same source overrides its earlier one field by field, so
    /// only the latest sample per attribute counts at the next tick.
    pub fn submit(&self, source: &str, commands: &[(String, JointCommand)]) {
        let mut state = self.state.lock();
        if state.stopped.contains(source) {
            debug!(source, "command from stopped source dropped");
            return;
        }
        let per_joint = state.pending.entry(source.to_string()).or_default();
        for (joint, cmd) in commands {
            let slot = per_joint.entry(joint.clone()).or_default();
            if cmd.position.is_some() {
                slot.position = cmd.position;
            }
            if cmd.velocity.is_some() {
                slot.velocity = cmd.velocity;
            }
            if cmd.load.is_some() {
                slot.load = cmd.load;
            }
        }
    }

    /// Drop `source`'s pending commands and ignore its future submissions.
    ///
    /// Retirement is permanent for the manager's lifetime: the name stays
    /// on the stopped list so late in-flight submissions from a finished
    /// actor can never resurrect its commands. An actor that restarts must
    /// submit under a new source name.
    pub fn stop_submit(&self, source: &str) {
        let mut state = self.state.lock();
        state.pending.remove(source);
        state.stopped.insert(source.to_string());
    }
}

/// Aggregates joint commands from many sources and forwards one reduced
/// command per joint per tick.
///
/// Runs as a `LoopTask` on its own loop. Each tick atomically drains the
/// pending map; joints nobody commanded are left untouched.
pub struct JointManager {
    joints: HashMap<String, Arc<Joint>>,
    reductions: Reductions,
    state: Arc<Mutex<ManagerState>>,
}

impl JointManager {
    pub fn new(joints: Vec<Arc<Joint>>, reductions: Reductions) -> Self {
        let joints = joints
            .into_iter()
            .map(|j| (j.name().to_string(), j))
            .collect();
        Self {
            joints,
            reductions,
            state: Arc::new(Mutex::new(ManagerState::default())),
        }
    }

    pub fn sink(&self) -> CommandSink {
        CommandSink {
            state: Arc::clone(&self.state),
        }
    }

    pub fn joint_names(&self) -> impl Iterator<Item = &str> {
        self.joints.keys().map(|s| s.as_str())
    }

    fn drain(&self) -> HashMap<String, HashMap<String, JointCommand>> {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// Drain and forward once. Normally driven by the loop tick; exposed
    /// so a robot can run the manager behind a shared handle.
    pub fn process(&self) {
        let drained = self.drain();
        if drained.is_empty() {
            return;
        }
        // joint -> per-attribute sample lists across sources
        let mut samples: HashMap<&str, (Vec<f64>, Vec<f64>, Vec<f64>)> = HashMap::new();
        for per_joint in drained.values() {
            for (joint_name, cmd) in per_joint {
                let Some(joint_name) = self.joints.get_key_value(joint_name.as_str()) else {
                    debug!(joint = %joint_name, "command for unknown joint dropped");
                    continue;
                };
                let entry = samples.entry(joint_name.0.as_str()).or_default();
                if let Some(p) = cmd.position {
                    entry.0.push(p);
                }
                if let Some(v) = cmd.velocity {
                    entry.1.push(v);
                }
                if let Some(l) = cmd.load {
                    entry.2.push(l);
                }
            }
        }
        for (joint_name, (positions, velocities, loads)) in samples {
            let command = JointCommand {
                position: self.reductions.position.reduce(&positions),
                velocity: self.reductions.velocity.reduce(&velocities),
                load: self.reductions.load.reduce(&loads),
            };
            if command.is_empty() {
                continue;
            }
            if let Some(joint) = self.joints.get(joint_name) {
                joint.apply(&command);
            }
        }
    }
}

impl LoopTask for JointManager {
    fn tick(&mut self) -> Result<()> {
        self.process();
        Ok(())
    }
}
