//! 骨骼与刚体之间的变换同步
//!
//! 每个刚体持有一个 `MotionState`，记录同步方式和刚体相对骨骼的偏移。
//! 这里只有纯函数：输入骨骼全局变换和物理变换，输出新的变换，
//! 不依赖具体的物理引擎。

use glam::Mat4;

use super::convert::safe_inverse;
use crate::pmx::RigidBodyMode;

/// 同步方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionKind {
    /// 运动学：刚体跟随骨骼，物理不回写
    Kinematic,
    /// 无关联骨骼的动态刚体，独立维护自身变换
    Dynamic,
    /// 动态刚体，模拟结果完整写回骨骼
    DynamicBone,
    /// 动态刚体，只写回旋转，骨骼位置保持动画结果
    DynamicBoneMerge,
}

impl MotionKind {
    /// 由 PMX 物理模式和是否有关联骨骼确定同步方式
    pub fn from_mode(mode: RigidBodyMode, has_bone: bool) -> Self {
        match (mode, has_bone) {
            (RigidBodyMode::Static, _) => MotionKind::Kinematic,
            (_, false) => MotionKind::Dynamic,
            (RigidBodyMode::Dynamic, true) => MotionKind::DynamicBone,
            (RigidBodyMode::DynamicWithBonePosition, true) => MotionKind::DynamicBoneMerge,
        }
    }

    /// 在物理世界中是否为运动学刚体
    #[inline]
    pub fn is_kinematic(self) -> bool {
        self == MotionKind::Kinematic
    }

    /// 模拟结果是否写回骨骼
    #[inline]
    pub fn reflects_to_bone(self) -> bool {
        matches!(self, MotionKind::DynamicBone | MotionKind::DynamicBoneMerge)
    }
}

/// 刚体同步状态
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionState {
    pub kind: MotionKind,
    /// 刚体相对骨骼的偏移：rigid = bone * offset
    pub offset: Mat4,
    pub inv_offset: Mat4,
    /// 初始世界变换（无骨骼时的重置目标）
    pub initial: Mat4,
}

impl MotionState {
    /// `bone_global` 为绑定姿势下骨骼的全局变换，没有骨骼时偏移即为刚体世界变换
    ///
    /// 骨骼矩阵不可逆（如零缩放）时按单位矩阵处理。
    pub fn new(kind: MotionKind, rigid_world: Mat4, bone_global: Option<Mat4>) -> Self {
        let offset = match bone_global {
            Some(bone) => safe_inverse(bone) * rigid_world,
            None => rigid_world,
        };
        Self {
            kind,
            offset,
            inv_offset: safe_inverse(offset),
            initial: rigid_world,
        }
    }

    /// 运动学刚体每步的目标世界变换，非运动学返回 None
    pub fn kinematic_target(&self, bone_global: Option<Mat4>) -> Option<Mat4> {
        if !self.kind.is_kinematic() {
            return None;
        }
        Some(match bone_global {
            Some(bone) => bone * self.offset,
            None => self.initial,
        })
    }

    /// 重置时刚体应处的世界变换
    pub fn reset_transform(&self, bone_global: Option<Mat4>) -> Mat4 {
        match bone_global {
            Some(bone) => bone * self.offset,
            None => self.initial,
        }
    }

    /// 模拟后骨骼的新全局变换，不回写时返回 None
    ///
    /// BoneMerge 模式取模拟得到的旋转列，保留骨骼原本的平移列。
    pub fn reflect_global_transform(&self, bone_global: Mat4, rigid_world: Mat4) -> Option<Mat4> {
        match self.kind {
            MotionKind::Kinematic | MotionKind::Dynamic => None,
            MotionKind::DynamicBone => Some(rigid_world * self.inv_offset),
            MotionKind::DynamicBoneMerge => {
                let mut result = rigid_world * self.inv_offset;
                result.w_axis = bone_global.w_axis;
                Some(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn bone_at(p: Vec3) -> Mat4 {
        Mat4::from_translation(p)
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(MotionKind::from_mode(RigidBodyMode::Static, true), MotionKind::Kinematic);
        assert_eq!(MotionKind::from_mode(RigidBodyMode::Static, false), MotionKind::Kinematic);
        assert_eq!(MotionKind::from_mode(RigidBodyMode::Dynamic, false), MotionKind::Dynamic);
        assert_eq!(MotionKind::from_mode(RigidBodyMode::Dynamic, true), MotionKind::DynamicBone);
        assert_eq!(
            MotionKind::from_mode(RigidBodyMode::DynamicWithBonePosition, true),
            MotionKind::DynamicBoneMerge
        );
    }

    #[test]
    fn test_kinematic_follows_bone() {
        let rigid = Mat4::from_translation(Vec3::new(0.0, 1.5, 0.0));
        let state = MotionState::new(MotionKind::Kinematic, rigid, Some(bone_at(Vec3::new(0.0, 1.0, 0.0))));

        let moved = bone_at(Vec3::new(2.0, 1.0, 0.0));
        let target = state.kinematic_target(Some(moved)).unwrap();
        assert!(target.w_axis.truncate().abs_diff_eq(Vec3::new(2.0, 1.5, 0.0), 1e-6));

        // 物理结果不回写
        assert_eq!(state.reflect_global_transform(moved, Mat4::IDENTITY), None);
    }

    #[test]
    fn test_dynamic_without_bone_keeps_own_transform() {
        let rigid = Mat4::from_translation(Vec3::new(0.0, 3.0, 0.0));
        let state = MotionState::new(MotionKind::Dynamic, rigid, None);
        assert_eq!(state.kinematic_target(None), None);
        assert_eq!(state.reset_transform(None), rigid);
    }

    #[test]
    fn test_dynamic_bone_writes_full_transform() {
        let bone = bone_at(Vec3::new(0.0, 1.0, 0.0));
        let rigid = Mat4::from_translation(Vec3::new(0.0, 1.5, 0.0));
        let state = MotionState::new(MotionKind::DynamicBone, rigid, Some(bone));

        let simulated = Mat4::from_rotation_translation(Quat::from_rotation_z(0.5), Vec3::new(0.3, 1.2, 0.0));
        let new_bone = state.reflect_global_transform(bone, simulated).unwrap();
        assert!((new_bone * state.offset).abs_diff_eq(simulated, 1e-5));
    }

    #[test]
    fn test_bone_merge_keeps_animated_position() {
        let bone = Mat4::from_rotation_translation(Quat::from_rotation_y(0.2), Vec3::new(0.0, 1.0, 0.0));
        let rigid = bone * Mat4::from_translation(Vec3::new(0.0, 0.5, 0.0));
        let state = MotionState::new(MotionKind::DynamicBoneMerge, rigid, Some(bone));

        let simulated = Mat4::from_rotation_translation(Quat::from_rotation_x(0.8), Vec3::new(5.0, 5.0, 5.0));
        let new_bone = state.reflect_global_transform(bone, simulated).unwrap();

        assert_eq!(new_bone.w_axis, bone.w_axis);
        let expected = simulated * state.inv_offset;
        assert!(new_bone.x_axis.abs_diff_eq(expected.x_axis, 1e-6));
        assert!(new_bone.y_axis.abs_diff_eq(expected.y_axis, 1e-6));
        assert!(new_bone.z_axis.abs_diff_eq(expected.z_axis, 1e-6));
    }

    #[test]
    fn test_reset_seeds_from_bone() {
        let bone = bone_at(Vec3::new(0.0, 1.0, 0.0));
        let rigid = Mat4::from_translation(Vec3::new(0.0, 1.5, 0.0));
        let state = MotionState::new(MotionKind::DynamicBoneMerge, rigid, Some(bone));
        let reset = state.reset_transform(Some(bone_at(Vec3::new(1.0, 1.0, 0.0))));
        assert!(reset.w_axis.truncate().abs_diff_eq(Vec3::new(1.0, 1.5, 0.0), 1e-6));
    }

    #[test]
    fn test_singular_bone_keeps_offsets_finite() {
        // 零缩放骨骼：偏移退化为刚体世界变换本身
        let bone = Mat4::from_scale_rotation_translation(Vec3::ZERO, Quat::IDENTITY, Vec3::Y);
        let rigid = Mat4::from_translation(Vec3::new(0.0, 1.5, 0.0));
        let state = MotionState::new(MotionKind::DynamicBone, rigid, Some(bone));

        assert!(state.offset.is_finite());
        assert!(state.inv_offset.is_finite());
        assert_eq!(state.offset, rigid);

        // 偏移本身奇异时逆矩阵也退化为单位矩阵
        let flat = MotionState::new(MotionKind::Dynamic, Mat4::from_scale(Vec3::ZERO), None);
        assert_eq!(flat.inv_offset, Mat4::IDENTITY);
    }
}
