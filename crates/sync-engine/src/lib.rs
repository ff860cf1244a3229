//! sync-engine: periodic register sync loops, joints, and robot assembly

mod config;
mod error;
mod joint;
mod looper;
mod manager;
mod robot;
mod sync;

pub use config::{
    load_robot_config, BusConfig, BusKind, DeviceConfig, GroupConfig, JointConfig, ManagerConfig,
    RobotConfig, SyncConfig,
};
pub use error::{ConfigError, Result, SyncError};
pub use joint::{Joint, JointChannel, JointCommand};
pub use looper::{spawn, LoopHandle, LoopRate, LoopTask, DEFAULT_PATIENCE};
pub use manager::{CommandSink, JointManager, Reduction, Reductions};
pub use robot::Robot;
pub use sync::{
    BulkReadSync, BulkWriteSync, MultiReadSync, MultiWriteSync, ReadSync, SyncClass, SyncGroup,
    WriteSync,
};
