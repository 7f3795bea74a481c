//! 骨骼集合
//!
//! BoneSet 以数组（arena）方式持有全部骨骼，父子关系全部用索引表示。
//! 负责变换层级的传播、附加变换、IK 调度以及蒙皮矩阵输出。

use std::collections::HashMap;

use glam::{Mat4, Quat};

use super::bone_link::BoneLink;
use super::ik_solver::IkSolver;

/// 骨骼集合
#[derive(Clone, Debug, Default)]
pub struct BoneSet {
    bones: Vec<BoneLink>,
    /// 按 deform_depth 稳定排序后的骨骼顺序
    sorted_order: Vec<usize>,
    ik_solvers: Vec<IkSolver>,
    name_map: HashMap<String, usize>,
}

impl BoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================
    // 构建
    // ========================================

    /// 添加骨骼，返回其索引
    pub fn add_bone(&mut self, mut bone: BoneLink) -> usize {
        let index = self.bones.len();
        bone.index = index;
        bone.parent = None;
        bone.children.clear();
        // 重名时保留第一个
        self.name_map.entry(bone.name.clone()).or_insert(index);
        self.bones.push(bone);
        self.sorted_order.push(index);
        index
    }

    /// 建立父子关系，子骨骼追加到父骨骼子列表末尾
    pub fn add_child(&mut self, parent: usize, child: usize) {
        if parent >= self.bones.len() || child >= self.bones.len() || parent == child {
            return;
        }
        if let Some(old) = self.bones[child].parent.take() {
            self.bones[old].children.retain(|&c| c != child);
        }
        self.bones[child].parent = Some(parent);
        self.bones[parent].children.push(child);
    }

    /// 添加 IK 求解器，并挂到 IK 骨骼上
    pub fn add_ik_solver(&mut self, solver: IkSolver) -> usize {
        let index = self.ik_solvers.len();
        if let Some(bone) = self.bones.get_mut(solver.bone_index) {
            bone.ik_solver = Some(index);
        }
        self.ik_solvers.push(solver);
        index
    }

    /// 按变换层级稳定排序
    pub fn build_sort_order(&mut self) {
        let mut order: Vec<usize> = (0..self.bones.len()).collect();
        order.sort_by_key(|&i| self.bones[i].deform_depth);
        self.sorted_order = order;
    }

    /// 计算绑定姿势：初始相对平移、全局变换与逆绑定矩阵
    pub fn build_bind_pose(&mut self) {
        for i in 0..self.bones.len() {
            let parent_pos = self.bones[i]
                .parent
                .map(|p| self.bones[p].initial_position)
                .unwrap_or_default();
            let bone = &mut self.bones[i];
            bone.init_translate = bone.initial_position - parent_pos;
            bone.begin_update_transform();
            bone.compute_local_transform();
        }
        self.update_all_global_transforms();
        for bone in &mut self.bones {
            bone.calculate_inverse_init_transform();
        }
    }

    // ========================================
    // 访问
    // ========================================

    #[inline]
    pub fn len(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    #[inline]
    pub fn bones(&self) -> &[BoneLink] {
        &self.bones
    }

    #[inline]
    pub fn bones_mut(&mut self) -> &mut [BoneLink] {
        &mut self.bones
    }

    #[inline]
    pub fn get_bone(&self, index: usize) -> Option<&BoneLink> {
        self.bones.get(index)
    }

    #[inline]
    pub fn get_bone_mut(&mut self, index: usize) -> Option<&mut BoneLink> {
        self.bones.get_mut(index)
    }

    pub fn find_bone_by_name(&self, name: &str) -> Option<usize> {
        self.name_map.get(name).copied()
    }

    #[inline]
    pub fn sorted_order(&self) -> &[usize] {
        &self.sorted_order
    }

    #[inline]
    pub fn ik_solvers(&self) -> &[IkSolver] {
        &self.ik_solvers
    }

    #[inline]
    pub fn ik_solvers_mut(&mut self) -> &mut [IkSolver] {
        &mut self.ik_solvers
    }

    pub fn find_ik_solver_by_name(&self, name: &str) -> Option<usize> {
        self.ik_solvers.iter().position(|s| s.name == name)
    }

    // ========================================
    // 每帧变换
    // ========================================

    /// 所有骨骼开始本帧变换
    pub fn begin_update(&mut self) {
        for bone in &mut self.bones {
            bone.begin_update_transform();
        }
    }

    /// 重新计算全部本地变换
    pub fn update_local_transforms(&mut self) {
        for bone in &mut self.bones {
            bone.compute_local_transform();
        }
    }

    /// 从全部根骨骼向下传播全局变换
    pub fn update_all_global_transforms(&mut self) {
        for i in 0..self.bones.len() {
            if self.bones[i].parent.is_none() {
                update_subtree(&mut self.bones, i);
            }
        }
    }

    /// 从指定骨骼向下传播全局变换
    #[inline]
    pub fn update_global_transform(&mut self, index: usize) {
        update_subtree(&mut self.bones, index);
    }

    /// 骨骼动画更新
    ///
    /// 只处理 deform_after_physics 与参数一致的骨骼，按变换层级顺序：
    /// 本地变换 → 全局变换 → 附加变换 / IK → 全局变换。
    pub fn update_node_animation(&mut self, after_physics: bool) {
        let order: Vec<usize> = self
            .sorted_order
            .iter()
            .copied()
            .filter(|&i| self.bones[i].deform_after_physics() == after_physics)
            .collect();

        for &i in &order {
            self.bones[i].compute_local_transform();
        }
        self.update_pass_tops(&order, after_physics);

        for &i in &order {
            if self.bones[i].append_parent.is_some() {
                self.update_append_transform(i);
                self.bones[i].compute_local_transform();
                update_subtree(&mut self.bones, i);
            }

            if let Some(solver_index) = self.bones[i].ik_solver {
                if let Some(solver) = self.ik_solvers.get(solver_index) {
                    if solver.enabled {
                        solver.solve(&mut self.bones);
                        update_subtree(&mut self.bones, i);
                    }
                }
            }
        }

        self.update_pass_tops(&order, after_physics);
    }

    /// 对本轮骨骼中父骨骼不属于本轮的骨骼（含根骨骼）传播全局变换
    fn update_pass_tops(&mut self, order: &[usize], after_physics: bool) {
        for &i in order {
            let is_top = match self.bones[i].parent {
                None => true,
                Some(p) => self.bones[p].deform_after_physics() != after_physics,
            };
            if is_top {
                update_subtree(&mut self.bones, i);
            }
        }
    }

    /// 计算附加变换
    pub fn update_append_transform(&mut self, index: usize) {
        let Some(append_index) = self.bones[index].append_parent else {
            return;
        };
        let Some(append) = self.bones.get(append_index) else {
            return;
        };

        let bone = &self.bones[index];
        let weight = bone.append_weight;
        let is_local = bone.is_append_local();
        let append_has_parent = append.append_parent.is_some();

        let append_rotate = if bone.is_append_rotate() {
            let mut q = if is_local || !append_has_parent {
                append.animate_rotate()
            } else {
                append.append_rotate
            };
            if append.enable_ik() {
                q = append.ik_rotate * q;
            }
            Some(Quat::IDENTITY.slerp(q, weight))
        } else {
            None
        };

        let append_translate = if bone.is_append_translate() {
            let t = if is_local || !append_has_parent {
                append.animate_translate() - append.init_translate
            } else {
                append.append_translate
            };
            Some(t * weight)
        } else {
            None
        };

        let bone = &mut self.bones[index];
        if let Some(q) = append_rotate {
            bone.append_rotate = q;
        }
        if let Some(t) = append_translate {
            bone.append_translate = t;
        }
    }

    // ========================================
    // 物理回写
    // ========================================

    /// 直接设置全局变换（物理回写）
    #[inline]
    pub fn set_global_transform(&mut self, index: usize, transform: Mat4) {
        if let Some(bone) = self.bones.get_mut(index) {
            bone.local_to_world = transform;
        }
    }

    /// 由全局变换反推本地变换：local = parent⁻¹ * global
    pub fn update_local_from_global(&mut self, index: usize) {
        if index >= self.bones.len() {
            return;
        }
        let global = self.bones[index].local_to_world;
        self.bones[index].local_to_parent = match self.bones[index].parent {
            Some(p) => {
                let parent = self.bones[p].local_to_world;
                let det = parent.determinant();
                // 父矩阵奇异时按单位矩阵处理
                if det.abs() > 1e-12 && det.is_finite() {
                    parent.inverse() * global
                } else {
                    global
                }
            }
            None => global,
        };
    }

    // ========================================
    // 动画辅助
    // ========================================

    /// 清零全部动画增量
    pub fn reset_animation(&mut self) {
        for bone in &mut self.bones {
            bone.reset_animation();
        }
    }

    pub fn save_base_animation(&mut self) {
        for bone in &mut self.bones {
            bone.save_base_animation();
        }
        for solver in &mut self.ik_solvers {
            solver.save_base_animation();
        }
    }

    pub fn load_base_animation(&mut self) {
        for bone in &mut self.bones {
            bone.load_base_animation();
        }
        for solver in &mut self.ik_solvers {
            solver.load_base_animation();
        }
    }

    pub fn clear_base_animation(&mut self) {
        for bone in &mut self.bones {
            bone.clear_base_animation();
        }
        for solver in &mut self.ik_solvers {
            solver.clear_base_animation();
        }
    }

    /// 启用全部 IK 求解器
    pub fn enable_all_ik(&mut self) {
        for solver in &mut self.ik_solvers {
            solver.enabled = true;
        }
    }

    // ========================================
    // 蒙皮
    // ========================================

    /// 输出蒙皮矩阵
    pub fn skinning_matrices(&self) -> Vec<Mat4> {
        self.bones.iter().map(|b| b.get_skinning_matrix()).collect()
    }

    /// 写入已有缓冲区
    pub fn write_skinning_matrices(&self, out: &mut Vec<Mat4>) {
        out.clear();
        out.extend(self.bones.iter().map(|b| b.get_skinning_matrix()));
    }
}

/// 先序遍历子树，更新全局变换
pub(crate) fn update_subtree(bones: &mut [BoneLink], index: usize) {
    if index >= bones.len() {
        return;
    }
    let mut stack = vec![index];
    while let Some(i) = stack.pop() {
        let parent_world = bones[i].parent.map(|p| bones[p].local_to_world);
        bones[i].compute_global_transform(parent_world);
        stack.extend(bones[i].children.iter().rev().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    /// 三级链：根 (0,0,0) → (0,1,0) → (0,2,0)
    fn chain3() -> BoneSet {
        let mut set = BoneSet::new();
        for (i, y) in [0.0, 1.0, 2.0].iter().enumerate() {
            let mut bone = BoneLink::new(format!("bone{}", i));
            bone.initial_position = Vec3::new(0.0, *y, 0.0);
            set.add_bone(bone);
        }
        set.add_child(0, 1);
        set.add_child(1, 2);
        set.build_sort_order();
        set.build_bind_pose();
        set
    }

    #[test]
    fn test_global_is_parent_times_local() {
        let mut set = chain3();
        set.begin_update();
        set.bones_mut()[0].animation_rotate = Quat::from_rotation_z(0.3);
        set.bones_mut()[1].animation_rotate = Quat::from_rotation_x(-0.7);
        set.bones_mut()[2].animation_translate = Vec3::new(0.1, 0.0, 0.2);
        set.update_local_transforms();
        set.update_all_global_transforms();

        let bones = set.bones();
        assert!(bones[0].local_to_world.abs_diff_eq(bones[0].local_to_parent, 1e-6));
        for i in 1..3 {
            let p = bones[i].parent_id().unwrap();
            let expected = bones[p].local_to_world * bones[i].local_to_parent;
            assert!(bones[i].local_to_world.abs_diff_eq(expected, 1e-6));
        }
    }

    #[test]
    fn test_bind_pose_skinning_is_identity() {
        let set = chain3();
        for m in set.skinning_matrices() {
            assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-5));
        }
        assert_eq!(set.bones()[2].init_translate, Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_children_keep_insertion_order() {
        let mut set = BoneSet::new();
        for name in ["root", "a", "b", "c"] {
            set.add_bone(BoneLink::new(name.to_string()));
        }
        set.add_child(0, 2);
        set.add_child(0, 1);
        set.add_child(0, 3);
        assert_eq!(set.bones()[0].children(), &[2, 1, 3]);
        assert_eq!(set.find_bone_by_name("c"), Some(3));
    }

    #[test]
    fn test_append_rotate_half_weight() {
        let mut set = BoneSet::new();
        set.add_bone(BoneLink::new("src".to_string()));
        let mut follower = BoneLink::new("dst".to_string());
        follower.flags |= crate::skeleton::BoneFlags::APPEND_ROTATE;
        follower.append_weight = 0.5;
        follower.deform_depth = 1;
        let dst = set.add_bone(follower);
        set.bones_mut()[dst].append_parent = Some(0);
        set.build_sort_order();
        set.build_bind_pose();

        set.begin_update();
        set.bones_mut()[0].animation_rotate = Quat::from_rotation_y(1.0);
        set.update_node_animation(false);

        let q = set.bones()[dst].rotation();
        assert!(q.abs_diff_eq(Quat::from_rotation_y(0.5), 1e-5));
    }

    #[test]
    fn test_local_from_global_roundtrip() {
        let mut set = chain3();
        set.begin_update();
        set.bones_mut()[1].animation_rotate = Quat::from_rotation_z(0.4);
        set.update_local_transforms();
        set.update_all_global_transforms();

        let original_local = set.bones()[2].local_to_parent;
        let global = set.bones()[2].local_to_world;
        set.set_global_transform(2, global);
        set.update_local_from_global(2);
        assert!(set.bones()[2].local_to_parent.abs_diff_eq(original_local, 1e-5));
    }

    #[test]
    fn test_sort_is_stable_by_deform_depth() {
        let mut set = BoneSet::new();
        for (name, depth) in [("a", 1), ("b", 0), ("c", 1), ("d", 0)] {
            let mut bone = BoneLink::new(name.to_string());
            bone.deform_depth = depth;
            set.add_bone(bone);
        }
        set.build_sort_order();
        assert_eq!(set.sorted_order(), &[1, 3, 0, 2]);
    }
}
