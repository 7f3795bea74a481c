//! MMD 物理系统
//!
//! 基于 Rapier3D。刚体与骨骼之间的同步逻辑在 `motion_state` 中，
//! 与具体物理引擎无关；坐标转换集中在 `convert`。

pub mod config;
pub mod convert;
mod joint;
mod mmd_physics;
mod motion_state;
pub(crate) mod rigid_body;

pub use config::{get_config, reset_config, set_config, PhysicsConfig};
pub use convert::inv_z;
pub use joint::MmdJoint;
pub use mmd_physics::MmdPhysics;
pub use motion_state::{MotionKind, MotionState};
pub use rigid_body::{CollisionFilter, MmdRigidBody};
