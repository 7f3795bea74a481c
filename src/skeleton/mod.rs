//! 骨骼系统
//!
//! 核心设计思想：
//! - BoneLink: 单个骨骼节点
//! - BoneSet: 以索引管理骨骼层次结构（arena）
//! - IkSolver: IK 求解器

mod bone_link;
mod bone_set;
mod ik_solver;

pub use bone_link::{BoneLink, BoneFlags};
pub use bone_set::BoneSet;
pub use ik_solver::{IkSolver, IkConfig, IkLink};

// ============================================================================
// 类型别名
// ============================================================================

/// Bone 别名
pub type Bone = BoneLink;

/// BoneManager 别名
pub type BoneManager = BoneSet;
