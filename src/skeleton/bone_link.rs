//! 骨骼节点
//!
//! BoneLink 是骨骼系统的核心单元，每个 BoneLink 代表骨骼层次中的一个节点。
//! 节点之间只通过索引互相引用，所有节点由 BoneSet 持有。

use glam::{Vec3, Quat, Mat4};
use bitflags::bitflags;

use crate::pmx::{PmxBone, PmxBoneFlags};

// ============================================================================
// 骨骼标志
// ============================================================================

bitflags! {
    /// 骨骼标志位
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BoneFlags: u32 {
        /// 可旋转
        const ROTATABLE = 1 << 0;
        /// 可移动
        const MOVABLE = 1 << 1;
        /// 是 IK 骨骼
        const IK = 1 << 2;
        /// 附加旋转
        const APPEND_ROTATE = 1 << 3;
        /// 附加平移
        const APPEND_TRANSLATE = 1 << 4;
        /// 附加变换使用本地坐标
        const APPEND_LOCAL = 1 << 5;
        /// 固定轴
        const FIXED_AXIS = 1 << 6;
        /// 本地轴
        const LOCAL_AXIS = 1 << 7;
        /// 物理后变形
        const DEFORM_AFTER_PHYSICS = 1 << 8;
        /// IK 启用（IK 链上的节点）
        const IK_ENABLED = 1 << 9;
    }
}

impl BoneFlags {
    /// 从 PMX 文件标志转换
    pub fn from_pmx(pmx: PmxBoneFlags) -> Self {
        let mut flags = BoneFlags::empty();
        if pmx.contains(PmxBoneFlags::ROTATABLE) {
            flags.insert(BoneFlags::ROTATABLE);
        }
        if pmx.contains(PmxBoneFlags::MOVABLE) {
            flags.insert(BoneFlags::MOVABLE);
        }
        if pmx.contains(PmxBoneFlags::IK) {
            flags.insert(BoneFlags::IK);
        }
        if pmx.contains(PmxBoneFlags::APPEND_ROTATE) {
            flags.insert(BoneFlags::APPEND_ROTATE);
        }
        if pmx.contains(PmxBoneFlags::APPEND_TRANSLATE) {
            flags.insert(BoneFlags::APPEND_TRANSLATE);
        }
        if pmx.contains(PmxBoneFlags::APPEND_LOCAL) {
            flags.insert(BoneFlags::APPEND_LOCAL);
        }
        if pmx.contains(PmxBoneFlags::FIXED_AXIS) {
            flags.insert(BoneFlags::FIXED_AXIS);
        }
        if pmx.contains(PmxBoneFlags::LOCAL_AXIS) {
            flags.insert(BoneFlags::LOCAL_AXIS);
        }
        if pmx.contains(PmxBoneFlags::DEFORM_AFTER_PHYSICS) {
            flags.insert(BoneFlags::DEFORM_AFTER_PHYSICS);
        }
        flags
    }
}

// ============================================================================
// 骨骼节点
// ============================================================================

/// 骨骼节点
///
/// - 静态数据：名称、父子关系、标志、初始 TRS
/// - 动态数据：每帧更新的变换状态
/// - 变换计算：local_to_world = parent.local_to_world * local_to_parent
#[derive(Clone, Debug)]
pub struct BoneLink {
    // ========================================
    // 静态数据（初始化后不变）
    // ========================================

    /// 骨骼名称
    pub name: String,

    /// 骨骼索引（等于文件中的顺序）
    pub(crate) index: usize,

    /// 父骨骼
    pub(crate) parent: Option<usize>,

    /// 子骨骼（按插入顺序）
    pub(crate) children: Vec<usize>,

    /// 变换层级（用于排序）
    pub deform_depth: i32,

    /// 骨骼标志
    pub flags: BoneFlags,

    /// 初始位置（模型空间）
    pub initial_position: Vec3,

    /// 初始 TRS（相对父骨骼，绑定姿势）
    pub init_translate: Vec3,
    pub init_rotate: Quat,
    pub init_scale: Vec3,

    /// 逆绑定矩阵（用于蒙皮）
    pub inverse_init: Mat4,

    /// 附加变换父骨骼与比率
    pub append_parent: Option<usize>,
    pub append_weight: f32,

    /// 以此骨骼为 IK 骨骼的求解器索引
    pub ik_solver: Option<usize>,

    /// 固定轴方向
    pub fixed_axis: Vec3,

    /// 本地 X 轴
    pub local_axis_x: Vec3,

    /// 本地 Z 轴
    pub local_axis_z: Vec3,

    // ========================================
    // 动态数据（每帧更新）
    // ========================================

    /// 当前 TRS（每帧重置为初始值，骨骼 Morph 在此叠加）
    pub translate: Vec3,
    pub rotate: Quat,
    pub scale: Vec3,

    /// 动画平移
    pub animation_translate: Vec3,

    /// 动画旋转
    pub animation_rotate: Quat,

    /// 基础动画快照（交叉淡入用）
    pub base_animation_translate: Vec3,
    pub base_animation_rotate: Quat,

    /// IK 旋转
    pub ik_rotate: Quat,

    /// 附加平移（计算结果）
    pub append_translate: Vec3,

    /// 附加旋转（计算结果）
    pub append_rotate: Quat,

    /// 本地变换矩阵
    pub local_to_parent: Mat4,

    /// 全局变换矩阵
    pub local_to_world: Mat4,
}

impl BoneLink {
    /// 创建新骨骼
    pub fn new(name: String) -> Self {
        Self {
            name,
            index: 0,
            parent: None,
            children: Vec::new(),
            deform_depth: 0,
            flags: BoneFlags::ROTATABLE,
            initial_position: Vec3::ZERO,
            init_translate: Vec3::ZERO,
            init_rotate: Quat::IDENTITY,
            init_scale: Vec3::ONE,
            inverse_init: Mat4::IDENTITY,
            append_parent: None,
            append_weight: 0.0,
            ik_solver: None,
            fixed_axis: Vec3::Z,
            local_axis_x: Vec3::X,
            local_axis_z: Vec3::Z,
            translate: Vec3::ZERO,
            rotate: Quat::IDENTITY,
            scale: Vec3::ONE,
            animation_translate: Vec3::ZERO,
            animation_rotate: Quat::IDENTITY,
            base_animation_translate: Vec3::ZERO,
            base_animation_rotate: Quat::IDENTITY,
            ik_rotate: Quat::IDENTITY,
            append_translate: Vec3::ZERO,
            append_rotate: Quat::IDENTITY,
            local_to_parent: Mat4::IDENTITY,
            local_to_world: Mat4::IDENTITY,
        }
    }

    /// 从 PMX 骨骼数据创建
    ///
    /// 父子关系与附加父骨骼由加载器校验后再设置。
    pub fn from_pmx_bone(pmx: &PmxBone) -> Self {
        let mut bone = Self::new(pmx.name.clone());
        bone.deform_depth = pmx.deform_depth;
        bone.flags = BoneFlags::from_pmx(pmx.flags);

        // MMD 使用左手坐标系，翻转 Z 轴转换为右手坐标系
        bone.initial_position = flip_z(pmx.position);

        if let Some((_, rate)) = pmx.append {
            bone.append_weight = rate;
        }

        if let Some(axis) = pmx.fixed_axis {
            bone.fixed_axis = flip_z(axis);
        }

        if let Some((x, z)) = pmx.local_axis {
            bone.local_axis_x = flip_z(x);
            bone.local_axis_z = flip_z(z);
        }

        bone
    }

    // ========================================
    // 访问器
    // ========================================

    /// 骨骼索引
    #[inline]
    pub fn link_id(&self) -> usize {
        self.index
    }

    /// 父骨骼索引
    #[inline]
    pub fn parent_id(&self) -> Option<usize> {
        self.parent
    }

    /// 子骨骼索引
    #[inline]
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    /// 是否为根骨骼
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// 获取世界位置
    #[inline]
    pub fn position(&self) -> Vec3 {
        self.local_to_world.col(3).truncate()
    }

    /// 获取世界旋转
    #[inline]
    pub fn rotation(&self) -> Quat {
        Quat::from_mat4(&self.local_to_world)
    }

    /// 动画旋转与当前旋转的合成
    #[inline]
    pub fn animate_rotate(&self) -> Quat {
        self.animation_rotate * self.rotate
    }

    /// 动画平移与当前平移的合成
    #[inline]
    pub fn animate_translate(&self) -> Vec3 {
        self.animation_translate + self.translate
    }

    // ========================================
    // 变换计算
    // ========================================

    /// 开始本帧变换：TRS 回到初始值，清除 IK 与附加变换累积
    ///
    /// 动画值不在这里清除，由动画求值覆盖。
    pub fn begin_update_transform(&mut self) {
        self.translate = self.init_translate;
        self.rotate = self.init_rotate;
        self.scale = self.init_scale;
        self.ik_rotate = Quat::IDENTITY;
        self.append_translate = Vec3::ZERO;
        self.append_rotate = Quat::IDENTITY;
    }

    /// 清零动画增量
    #[inline]
    pub fn reset_animation(&mut self) {
        self.animation_translate = Vec3::ZERO;
        self.animation_rotate = Quat::IDENTITY;
        self.ik_rotate = Quat::IDENTITY;
        self.append_translate = Vec3::ZERO;
        self.append_rotate = Quat::IDENTITY;
    }

    /// 计算本地变换 (local_to_parent)
    ///
    /// 变换顺序：
    /// 1. 平移 = animation_translate + translate (+ append_translate)
    /// 2. 旋转 = ik_rotate * animation_rotate * rotate (* append_rotate)
    pub fn compute_local_transform(&mut self) {
        let mut translate = self.animate_translate();
        if self.flags.contains(BoneFlags::APPEND_TRANSLATE) {
            translate += self.append_translate;
        }

        let mut rotation = self.animate_rotate();
        if self.flags.contains(BoneFlags::IK_ENABLED) {
            rotation = self.ik_rotate * rotation;
        }
        if self.flags.contains(BoneFlags::APPEND_ROTATE) {
            rotation *= self.append_rotate;
        }

        self.local_to_parent = Mat4::from_scale_rotation_translation(self.scale, rotation, translate);
    }

    /// 由父骨骼全局变换更新自身全局变换（不递归）
    #[inline]
    pub fn compute_global_transform(&mut self, parent_world: Option<Mat4>) {
        self.local_to_world = match parent_world {
            Some(parent) => parent * self.local_to_parent,
            None => self.local_to_parent,
        };
    }

    /// 记录绑定姿势的逆矩阵，奇异矩阵回退为单位矩阵
    pub fn calculate_inverse_init_transform(&mut self) {
        let det = self.local_to_world.determinant();
        self.inverse_init = if det.abs() > 1e-12 && det.is_finite() {
            self.local_to_world.inverse()
        } else {
            log::warn!("骨骼 '{}' 的绑定矩阵不可逆，使用单位矩阵", self.name);
            Mat4::IDENTITY
        };
    }

    /// 获取蒙皮矩阵
    /// skinning_matrix = local_to_world * inverse_init
    #[inline]
    pub fn get_skinning_matrix(&self) -> Mat4 {
        self.local_to_world * self.inverse_init
    }

    // ========================================
    // 基础动画快照
    // ========================================

    #[inline]
    pub fn save_base_animation(&mut self) {
        self.base_animation_translate = self.animation_translate;
        self.base_animation_rotate = self.animation_rotate;
    }

    #[inline]
    pub fn load_base_animation(&mut self) {
        self.animation_translate = self.base_animation_translate;
        self.animation_rotate = self.base_animation_rotate;
    }

    #[inline]
    pub fn clear_base_animation(&mut self) {
        self.base_animation_translate = Vec3::ZERO;
        self.base_animation_rotate = Quat::IDENTITY;
    }

    // ========================================
    // 便捷方法
    // ========================================

    /// 获取全局变换
    #[inline]
    pub fn global_transform(&self) -> Mat4 {
        self.local_to_world
    }

    /// 获取本地变换
    #[inline]
    pub fn local_transform(&self) -> Mat4 {
        self.local_to_parent
    }

    // ========================================
    // 标志检查方法
    // ========================================

    #[inline]
    pub fn is_rotatable(&self) -> bool {
        self.flags.contains(BoneFlags::ROTATABLE)
    }

    #[inline]
    pub fn is_movable(&self) -> bool {
        self.flags.contains(BoneFlags::MOVABLE)
    }

    #[inline]
    pub fn is_ik(&self) -> bool {
        self.flags.contains(BoneFlags::IK)
    }

    #[inline]
    pub fn is_append_rotate(&self) -> bool {
        self.flags.contains(BoneFlags::APPEND_ROTATE)
    }

    #[inline]
    pub fn is_append_translate(&self) -> bool {
        self.flags.contains(BoneFlags::APPEND_TRANSLATE)
    }

    #[inline]
    pub fn is_append_local(&self) -> bool {
        self.flags.contains(BoneFlags::APPEND_LOCAL)
    }

    #[inline]
    pub fn deform_after_physics(&self) -> bool {
        self.flags.contains(BoneFlags::DEFORM_AFTER_PHYSICS)
    }

    #[inline]
    pub fn enable_ik(&self) -> bool {
        self.flags.contains(BoneFlags::IK_ENABLED)
    }

    #[inline]
    pub fn set_enable_ik(&mut self, enabled: bool) {
        self.flags.set(BoneFlags::IK_ENABLED, enabled);
    }
}

impl Default for BoneLink {
    fn default() -> Self {
        Self::new(String::new())
    }
}

#[inline]
fn flip_z(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.y, -v.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_update_keeps_animation() {
        let mut bone = BoneLink::new("腕".to_string());
        bone.init_translate = Vec3::new(0.0, 1.0, 0.0);
        bone.translate = Vec3::new(5.0, 5.0, 5.0);
        bone.animation_translate = Vec3::new(1.0, 0.0, 0.0);
        bone.ik_rotate = Quat::from_rotation_x(0.5);

        bone.begin_update_transform();

        assert_eq!(bone.translate, Vec3::new(0.0, 1.0, 0.0));
        assert_eq!(bone.ik_rotate, Quat::IDENTITY);
        assert_eq!(bone.animation_translate, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_local_transform_ignores_ik_when_disabled() {
        let mut bone = BoneLink::new("ひざ".to_string());
        bone.ik_rotate = Quat::from_rotation_x(1.0);
        bone.compute_local_transform();
        assert!(bone.local_to_parent.abs_diff_eq(Mat4::IDENTITY, 1e-6));

        bone.set_enable_ik(true);
        bone.compute_local_transform();
        let expected = Mat4::from_quat(Quat::from_rotation_x(1.0));
        assert!(bone.local_to_parent.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn test_singular_inverse_falls_back_to_identity() {
        let mut bone = BoneLink::new("潰れ".to_string());
        bone.init_scale = Vec3::new(0.0, 1.0, 1.0);
        bone.begin_update_transform();
        bone.compute_local_transform();
        bone.compute_global_transform(None);
        bone.calculate_inverse_init_transform();
        assert_eq!(bone.inverse_init, Mat4::IDENTITY);
    }
}
