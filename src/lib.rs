//! MMD Runtime - Rust 实现的 MMD 角色动画运行时
//!
//! 提供以下功能：
//! - PMX 模型解析与运行时模型构建
//! - VMD 动画解析和播放（骨骼 / Morph / IK 轨道）
//! - VPD 姿势文件
//! - 骨骼系统和 IK 求解
//! - Morph 变形系统
//! - 物理桥接（Rapier3D）
//! - 顶点蒙皮计算

pub mod animation;
pub mod model;
pub mod morph;
pub mod physics;
pub mod pmx;
pub mod skeleton;
pub mod skinning;

pub use animation::{VmdAnimation, VmdFile, VpdFile};
pub use model::{load_pmx, MmdModel};
pub use morph::{Morph, MorphManager};
pub use physics::{MmdJoint, MmdPhysics, MmdRigidBody};
pub use pmx::PmxModel;
pub use skeleton::{Bone, BoneManager, IkSolver};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PMX parse error: {0}")]
    PmxParse(String),

    #[error("VMD parse error: {0}")]
    VmdParse(String),

    #[error("VPD parse error: {0}")]
    VpdParse(String),

    #[error("Physics error: {0}")]
    Physics(String),
}

pub type Result<T> = std::result::Result<T, MmdError>;
