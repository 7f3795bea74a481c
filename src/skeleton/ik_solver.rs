//! IK 求解器
//!
//! 设计原则：
//! - 使用迭代求解方式（带回退的爬山法）
//! - 支持角度限制
//! - 支持单轴模式（膝盖等）

use glam::{Vec3, Quat, Mat3};
use std::f32::consts::PI;

use super::bone_link::{BoneLink, BoneFlags};
use super::bone_set::update_subtree;

// ============================================================================
// IK 配置
// ============================================================================

/// IK 链接信息
#[derive(Clone, Debug)]
pub struct IkLink {
    /// 链接骨骼索引
    pub bone_index: usize,
    /// 是否有角度限制
    pub has_limits: bool,
    /// 角度下限 (弧度)
    pub limit_min: Vec3,
    /// 角度上限 (弧度)
    pub limit_max: Vec3,
}

/// IK 配置
#[derive(Clone, Debug)]
pub struct IkConfig {
    /// 末端骨骼索引（需要接近 IK 骨骼的骨骼）
    pub target_bone: usize,
    /// 迭代次数
    pub iterations: u32,
    /// 单次迭代角度限制
    pub limit_angle: f32,
    /// IK 链接列表（从靠近末端到靠近根）
    pub links: Vec<IkLink>,
}

// ============================================================================
// IK 链状态
// ============================================================================

/// IK 链节点状态
#[derive(Clone, Debug, Default)]
struct IkChainState {
    /// 上一次迭代的欧拉角（用于连续性）
    prev_angle: Vec3,
    /// 单轴模式下的累积角度
    plane_mode_angle: f32,
    /// 最佳 IK 旋转（用于回退）
    best_ik_rotate: Quat,
}

/// 求解轴类型
#[derive(Clone, Copy, Debug, PartialEq)]
enum SolveAxis {
    X,
    Y,
    Z,
}

/// 收敛判定距离
const CONVERGED_DISTANCE: f32 = 1.0e-5;

// ============================================================================
// IK 求解器
// ============================================================================

/// IK 求解器
#[derive(Clone, Debug)]
pub struct IkSolver {
    /// 名称（等于 IK 骨骼名，VMD 的 IK 轨道按此查找）
    pub name: String,
    /// IK 骨骼索引（末端要到达的位置）
    pub bone_index: usize,
    /// IK 配置
    pub config: IkConfig,
    /// 是否启用
    pub enabled: bool,
    /// 基础动画中的启用状态（交叉淡入用）
    pub base_animation_enabled: bool,
}

impl IkSolver {
    /// 创建新的 IK 求解器
    pub fn new(name: String, bone_index: usize, config: IkConfig) -> Self {
        Self {
            name,
            bone_index,
            config,
            enabled: true,
            base_animation_enabled: true,
        }
    }

    #[inline]
    pub fn save_base_animation(&mut self) {
        self.base_animation_enabled = self.enabled;
    }

    #[inline]
    pub fn load_base_animation(&mut self) {
        self.enabled = self.base_animation_enabled;
    }

    #[inline]
    pub fn clear_base_animation(&mut self) {
        self.base_animation_enabled = true;
    }

    /// 求解 IK，返回最终的末端到 IK 骨骼的距离
    pub fn solve(&self, bones: &mut [BoneLink]) -> f32 {
        let target_idx = self.config.target_bone;
        if !self.enabled || target_idx >= bones.len() || self.bone_index >= bones.len() {
            return f32::MAX;
        }

        let mut chain_states: Vec<IkChainState> = self.config.links
            .iter()
            .map(|_| IkChainState::default())
            .collect();

        // 初始化 IK 链骨骼
        for link in &self.config.links {
            let link_idx = link.bone_index;
            if link_idx < bones.len() {
                bones[link_idx].ik_rotate = Quat::IDENTITY;
                bones[link_idx].flags |= BoneFlags::IK_ENABLED;
                bones[link_idx].compute_local_transform();
                update_subtree(bones, link_idx);
            }
        }

        let mut best_distance = f32::MAX;

        for iteration in 0..self.config.iterations {
            self.solve_iteration(bones, target_idx, iteration, &mut chain_states);

            let distance = Self::effector_distance(bones, target_idx, self.bone_index);

            if distance < best_distance {
                best_distance = distance;
                for (i, link) in self.config.links.iter().enumerate() {
                    if link.bone_index < bones.len() {
                        chain_states[i].best_ik_rotate = bones[link.bone_index].ik_rotate;
                    }
                }
                if best_distance < CONVERGED_DISTANCE {
                    break;
                }
            } else {
                // 恢复最佳结果并退出
                for (i, link) in self.config.links.iter().enumerate() {
                    let link_idx = link.bone_index;
                    if link_idx < bones.len() {
                        bones[link_idx].ik_rotate = chain_states[i].best_ik_rotate;
                        bones[link_idx].compute_local_transform();
                        update_subtree(bones, link_idx);
                    }
                }
                break;
            }
        }

        best_distance.min(Self::effector_distance(bones, target_idx, self.bone_index))
    }

    fn effector_distance(bones: &[BoneLink], target_idx: usize, ik_idx: usize) -> f32 {
        (bones[target_idx].position() - bones[ik_idx].position()).length()
    }

    /// 单次迭代求解
    fn solve_iteration(
        &self,
        bones: &mut [BoneLink],
        target_idx: usize,
        iteration: u32,
        chain_states: &mut [IkChainState],
    ) {
        let ik_pos = bones[self.bone_index].position();

        for chain_idx in 0..self.config.links.len() {
            let link = &self.config.links[chain_idx];
            let link_idx = link.bone_index;

            if link_idx >= bones.len() || link_idx == target_idx {
                continue;
            }

            if link.has_limits {
                if let Some(axis) = Self::detect_plane_solve_axis(link) {
                    self.solve_plane(bones, target_idx, iteration, chain_idx, axis, chain_states);
                    continue;
                }
            }

            // 通用 3 轴求解
            let target_pos = bones[target_idx].position();
            let inv_link = bones[link_idx].local_to_world.inverse();

            let local_ik_pos = inv_link.transform_point3(ik_pos);
            let local_target_pos = inv_link.transform_point3(target_pos);

            let ik_vec = local_ik_pos.normalize_or_zero();
            let target_vec = local_target_pos.normalize_or_zero();

            if ik_vec.length_squared() < 1e-8 || target_vec.length_squared() < 1e-8 {
                continue;
            }

            let dot = target_vec.dot(ik_vec).clamp(-1.0, 1.0);
            let angle = dot.acos();

            if angle.to_degrees() < 1e-3 {
                continue;
            }

            let angle = angle.min(self.config.limit_angle.abs());
            let axis = target_vec.cross(ik_vec).normalize_or_zero();

            if axis.length_squared() < 1e-8 {
                continue;
            }

            let delta_rot = Quat::from_axis_angle(axis, angle);
            let animate_rotate = bones[link_idx].animate_rotate();
            let chain_rot = bones[link_idx].ik_rotate * animate_rotate * delta_rot;

            // 应用角度限制
            let chain_rot = if link.has_limits {
                let rot_mat = Mat3::from_quat(chain_rot);
                let state = &mut chain_states[chain_idx];
                let euler = Self::decompose_rotation(rot_mat, state.prev_angle);

                let mut clamped = euler.max(link.limit_min).min(link.limit_max);

                // 增量限制
                let delta = clamped - state.prev_angle;
                let limit = Vec3::splat(self.config.limit_angle.abs());
                clamped = delta.max(-limit).min(limit) + state.prev_angle;

                state.prev_angle = clamped;

                Self::compose_rotation(clamped)
            } else {
                chain_rot
            };

            bones[link_idx].ik_rotate = chain_rot * animate_rotate.inverse();
            bones[link_idx].compute_local_transform();
            update_subtree(bones, link_idx);
        }
    }

    /// 单轴求解（膝盖等关节）
    fn solve_plane(
        &self,
        bones: &mut [BoneLink],
        target_idx: usize,
        iteration: u32,
        chain_idx: usize,
        solve_axis: SolveAxis,
        chain_states: &mut [IkChainState],
    ) {
        let link = &self.config.links[chain_idx];
        let link_idx = link.bone_index;

        let (rotate_axis, limit_min, limit_max) = match solve_axis {
            SolveAxis::X => (Vec3::X, link.limit_min.x, link.limit_max.x),
            SolveAxis::Y => (Vec3::Y, link.limit_min.y, link.limit_max.y),
            SolveAxis::Z => (Vec3::Z, link.limit_min.z, link.limit_max.z),
        };

        let ik_pos = bones[self.bone_index].position();
        let target_pos = bones[target_idx].position();

        let inv_link = bones[link_idx].local_to_world.inverse();
        let ik_vec = inv_link.transform_point3(ik_pos).normalize_or_zero();
        let target_vec = inv_link.transform_point3(target_pos).normalize_or_zero();

        if ik_vec.length_squared() < 1e-8 || target_vec.length_squared() < 1e-8 {
            return;
        }

        let dot = target_vec.dot(ik_vec).clamp(-1.0, 1.0);
        let angle = dot.acos().min(self.config.limit_angle.abs());

        // 测试两个方向
        let rot_pos = Quat::from_axis_angle(rotate_axis, angle);
        let rot_neg = Quat::from_axis_angle(rotate_axis, -angle);

        let dot_pos = (rot_pos * target_vec).dot(ik_vec);
        let dot_neg = (rot_neg * target_vec).dot(ik_vec);

        let state = &mut chain_states[chain_idx];
        let mut new_angle = state.plane_mode_angle;
        if dot_pos > dot_neg {
            new_angle += angle;
        } else {
            new_angle -= angle;
        }

        // 第 0 次迭代超出范围时尝试反向，避免关节翻转
        if iteration == 0 && (new_angle < limit_min || new_angle > limit_max) {
            if -new_angle > limit_min && -new_angle < limit_max {
                new_angle = -new_angle;
            } else {
                let half = (limit_min + limit_max) * 0.5;
                if (half - new_angle).abs() > (half + new_angle).abs() {
                    new_angle = -new_angle;
                }
            }
        }

        new_angle = new_angle.max(limit_min).min(limit_max);
        state.plane_mode_angle = new_angle;

        let animate_rotate = bones[link_idx].animate_rotate();
        bones[link_idx].ik_rotate = Quat::from_axis_angle(rotate_axis, new_angle) * animate_rotate.inverse();
        bones[link_idx].compute_local_transform();
        update_subtree(bones, link_idx);
    }

    /// 检测是否应使用单轴模式
    fn detect_plane_solve_axis(link: &IkLink) -> Option<SolveAxis> {
        let active = |min: f32, max: f32| min != 0.0 || max != 0.0;
        let x = active(link.limit_min.x, link.limit_max.x);
        let y = active(link.limit_min.y, link.limit_max.y);
        let z = active(link.limit_min.z, link.limit_max.z);

        match (x, y, z) {
            (true, false, false) => Some(SolveAxis::X),
            (false, true, false) => Some(SolveAxis::Y),
            (false, false, true) => Some(SolveAxis::Z),
            _ => None,
        }
    }

    /// 从旋转矩阵分解欧拉角（R = Rz * Ry * Rx，返回 (x, y, z)）
    fn decompose_rotation(m: Mat3, prev: Vec3) -> Vec3 {
        let epsilon = 1.0e-6_f32;
        let sy = -m.col(0).z;

        let result = if (1.0 - sy.abs()) < epsilon {
            // 万向锁
            let ry = sy.clamp(-1.0, 1.0).asin();
            let sx = prev.x.sin();
            let sz = prev.z.sin();

            if sx.abs() < sz.abs() {
                let cx = prev.x.cos();
                if cx > 0.0 {
                    Vec3::new(0.0, ry, (-m.col(1).x).clamp(-1.0, 1.0).asin())
                } else {
                    Vec3::new(PI, ry, m.col(1).x.clamp(-1.0, 1.0).asin())
                }
            } else {
                let cz = prev.z.cos();
                if cz > 0.0 {
                    Vec3::new((-m.col(2).y).clamp(-1.0, 1.0).asin(), ry, 0.0)
                } else {
                    Vec3::new(m.col(2).y.clamp(-1.0, 1.0).asin(), ry, PI)
                }
            }
        } else {
            Vec3::new(
                m.col(1).z.atan2(m.col(2).z),
                (-m.col(0).z).asin(),
                m.col(0).y.atan2(m.col(0).x),
            )
        };

        Self::find_closest_euler(result, prev)
    }

    /// `decompose_rotation` 的逆：R = Rz * Ry * Rx
    fn compose_rotation(euler: Vec3) -> Quat {
        Quat::from_rotation_z(euler.z) * Quat::from_rotation_y(euler.y) * Quat::from_rotation_x(euler.x)
    }

    /// 找到最接近 prev 的欧拉角表示
    fn find_closest_euler(r: Vec3, prev: Vec3) -> Vec3 {
        let candidates = [
            r,
            Vec3::new(r.x + PI, PI - r.y, r.z + PI),
            Vec3::new(r.x + PI, PI - r.y, r.z - PI),
            Vec3::new(r.x + PI, -PI - r.y, r.z + PI),
            Vec3::new(r.x + PI, -PI - r.y, r.z - PI),
            Vec3::new(r.x - PI, PI - r.y, r.z + PI),
            Vec3::new(r.x - PI, PI - r.y, r.z - PI),
            Vec3::new(r.x - PI, -PI - r.y, r.z + PI),
            Vec3::new(r.x - PI, -PI - r.y, r.z - PI),
        ];

        let mut best = r;
        let mut best_error = Self::euler_error(r, prev);

        for candidate in &candidates[1..] {
            let error = Self::euler_error(*candidate, prev);
            if error < best_error {
                best_error = error;
                best = *candidate;
            }
        }

        best
    }

    fn euler_error(a: Vec3, b: Vec3) -> f32 {
        Self::angle_diff(a.x, b.x).abs()
            + Self::angle_diff(a.y, b.y).abs()
            + Self::angle_diff(a.z, b.z).abs()
    }

    /// 计算角度差（考虑周期性）
    fn angle_diff(a: f32, b: f32) -> f32 {
        let mut diff = Self::normalize_angle(a) - Self::normalize_angle(b);
        if diff > PI {
            diff -= 2.0 * PI;
        } else if diff < -PI {
            diff += 2.0 * PI;
        }
        diff
    }

    /// 角度归一化到 [0, 2π)
    fn normalize_angle(angle: f32) -> f32 {
        let mut r = angle % (2.0 * PI);
        if r < 0.0 {
            r += 2.0 * PI;
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::BoneSet;

    type Limits = Option<(Vec3, Vec3)>;

    /// 根 (0,0,0) → 子 (0,1,0) → 末端 (0,2,0)；IK 骨骼独立位于 goal
    fn two_link_chain(goal: Vec3, iterations: u32, knee_limit: Limits) -> BoneSet {
        limited_chain(goal, iterations, [knee_limit, None])
    }

    /// `limits[0]` 作用于子骨骼，`limits[1]` 作用于根骨骼
    fn limited_chain(goal: Vec3, iterations: u32, limits: [Limits; 2]) -> BoneSet {
        let mut set = BoneSet::new();
        let positions = [
            ("root", Vec3::ZERO),
            ("child", Vec3::new(0.0, 1.0, 0.0)),
            ("tip", Vec3::new(0.0, 2.0, 0.0)),
            ("ik", goal),
        ];
        for (name, pos) in positions {
            let mut bone = BoneLink::new(name.to_string());
            bone.initial_position = pos;
            set.add_bone(bone);
        }
        set.add_child(0, 1);
        set.add_child(1, 2);
        set.build_sort_order();
        set.build_bind_pose();

        let link = |bone_index: usize, limit: Limits| match limit {
            Some((limit_min, limit_max)) => IkLink { bone_index, has_limits: true, limit_min, limit_max },
            None => IkLink { bone_index, has_limits: false, limit_min: Vec3::ZERO, limit_max: Vec3::ZERO },
        };
        let config = IkConfig {
            target_bone: 2,
            iterations,
            limit_angle: PI,
            links: vec![link(1, limits[0]), link(0, limits[1])],
        };
        set.add_ik_solver(IkSolver::new("ik".to_string(), 3, config));
        set
    }

    /// 链接骨骼当前 IK 旋转的欧拉角 (x, y, z)
    fn link_euler(set: &BoneSet, bone: usize) -> Vec3 {
        let b = &set.bones()[bone];
        IkSolver::decompose_rotation(Mat3::from_quat(b.ik_rotate * b.animate_rotate()), Vec3::ZERO)
    }

    fn solve(set: &mut BoneSet) -> f32 {
        set.begin_update();
        set.update_local_transforms();
        set.update_all_global_transforms();
        let solver = set.ik_solvers()[0].clone();
        solver.solve(set.bones_mut())
    }

    #[test]
    fn test_reachable_target_converges() {
        let goal = Vec3::new(1.0, 1.0, 0.0);
        let mut set = two_link_chain(goal, 10, None);
        solve(&mut set);
        let tip = set.bones()[2].position();
        assert!((tip - goal).length() < 1e-3, "tip = {:?}", tip);
    }

    #[test]
    fn test_more_iterations_never_worse() {
        let goal = Vec3::new(0.8, 0.6, 0.3);
        let mut previous = f32::MAX;
        for iterations in 1..8 {
            let mut set = two_link_chain(goal, iterations, None);
            let distance = solve(&mut set);
            assert!(distance <= previous + 1e-6);
            previous = distance;
        }
    }

    #[test]
    fn test_unreachable_target_terminates() {
        let goal = Vec3::new(3.0, 3.0, 0.0);
        let mut set = two_link_chain(goal, 40, None);
        let distance = solve(&mut set);
        assert!(distance.is_finite());
        // 链长 2，最近距离为 |goal| - 2
        assert!(distance >= goal.length() - 2.0 - 1e-3);
        let tip = set.bones()[2].position();
        assert!(((tip - goal).length() - distance).abs() < 1e-3);
    }

    #[test]
    fn test_result_is_best_found() {
        let goal = Vec3::new(-0.5, 0.4, 0.9);
        let mut set = two_link_chain(goal, 15, None);
        let distance = solve(&mut set);
        let tip = set.bones()[2].position();
        assert!(((tip - goal).length() - distance).abs() < 1e-4);
    }

    #[test]
    fn test_plane_mode_respects_limit() {
        // 子骨骼只允许绕 X 轴在 [-π, 0] 内旋转
        let goal = Vec3::new(0.0, 1.2, 0.8);
        let limits = (Vec3::new(-PI, 0.0, 0.0), Vec3::new(0.0, 0.0, 0.0));
        let mut set = two_link_chain(goal, 20, Some(limits));
        let distance = solve(&mut set);
        assert!(distance.is_finite());

        let child = &set.bones()[1];
        let (axis, angle) = (child.ik_rotate * child.animate_rotate()).to_axis_angle();
        if angle.abs() > 1e-4 {
            assert!(axis.y.abs() < 1e-3 && axis.z.abs() < 1e-3);
        }
    }

    #[test]
    fn test_disabled_solver_is_noop() {
        let mut set = two_link_chain(Vec3::new(1.0, 1.0, 0.0), 10, None);
        set.ik_solvers_mut()[0].enabled = false;
        set.begin_update();
        set.update_node_animation(false);
        assert!(set.bones()[2].position().abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-6));
    }

    #[test]
    fn test_detect_plane_axis() {
        let link = IkLink {
            bone_index: 0,
            has_limits: true,
            limit_min: Vec3::new(-3.0, 0.0, 0.0),
            limit_max: Vec3::new(-0.01, 0.0, 0.0),
        };
        assert_eq!(IkSolver::detect_plane_solve_axis(&link), Some(SolveAxis::X));

        let link = IkLink {
            limit_min: Vec3::new(-1.0, -1.0, 0.0),
            ..link
        };
        assert_eq!(IkSolver::detect_plane_solve_axis(&link), None);
    }

    #[test]
    fn test_euler_decompose_compose_roundtrip() {
        let q = Quat::from_rotation_z(0.5) * Quat::from_rotation_y(0.3) * Quat::from_rotation_x(0.4);
        let euler = IkSolver::decompose_rotation(Mat3::from_quat(q), Vec3::ZERO);
        assert!(euler.abs_diff_eq(Vec3::new(0.4, 0.3, 0.5), 1e-5), "euler = {:?}", euler);
        let rebuilt = IkSolver::compose_rotation(euler);
        assert!(rebuilt.dot(q).abs() > 1.0 - 1e-6);
    }

    #[test]
    fn test_wide_limits_match_unlimited() {
        let goal = Vec3::new(0.5, 1.2, 0.8);
        let wide = Some((Vec3::splat(-3.0), Vec3::splat(3.0)));

        let mut free = limited_chain(goal, 20, [None, None]);
        solve(&mut free);
        let mut limited = limited_chain(goal, 20, [wide, wide]);
        solve(&mut limited);

        let free_tip = free.bones()[2].position();
        let limited_tip = limited.bones()[2].position();
        assert!((free_tip - goal).length() < 2e-3, "free tip = {:?}", free_tip);
        assert!((limited_tip - free_tip).length() < 1e-3, "limited tip = {:?}", limited_tip);
    }

    #[test]
    fn test_binding_limits_keep_angles_in_range() {
        let goal = Vec3::new(1.0, 1.0, 0.5);
        let (min, max) = (Vec3::splat(-0.4), Vec3::splat(0.4));
        let mut set = limited_chain(goal, 30, [Some((min, max)), Some((min, max))]);
        let distance = solve(&mut set);
        assert!(distance.is_finite());

        for bone in [0, 1] {
            let euler = link_euler(&set, bone);
            assert!(euler.cmpge(min - Vec3::splat(1e-4)).all(), "bone {} euler = {:?}", bone, euler);
            assert!(euler.cmple(max + Vec3::splat(1e-4)).all(), "bone {} euler = {:?}", bone, euler);
        }
        // 限制生效时无法到达目标
        assert!(distance > 0.1);
    }

    #[test]
    fn test_angle_cap_per_iteration() {
        let goal = Vec3::new(1.0, 1.0, 0.5);
        let wide = Some((Vec3::splat(-3.0), Vec3::splat(3.0)));
        let mut set = limited_chain(goal, 1, [wide, wide]);
        set.ik_solvers_mut()[0].config.limit_angle = 0.1;
        solve(&mut set);

        for bone in [0, 1] {
            let euler = link_euler(&set, bone);
            assert!(euler.abs().max_element() <= 0.1 + 1e-4, "bone {} euler = {:?}", bone, euler);
        }
    }

    #[test]
    fn test_plane_mode_reflects_first_iteration() {
        // 目标需要绕 X 负向旋转，但只允许 [0.1, π]：第一次迭代反向后落入范围
        let goal = Vec3::new(0.0, 1.2, -0.8);
        let limits = (Vec3::new(0.1, 0.0, 0.0), Vec3::new(PI, 0.0, 0.0));
        let mut set = two_link_chain(goal, 1, Some(limits));
        solve(&mut set);

        let expected = (goal - Vec3::Y).normalize().dot(Vec3::Y).acos();
        let q = set.bones()[1].ik_rotate;
        let angle = 2.0 * q.x.atan2(q.w);
        assert!(q.y.abs() < 1e-6 && q.z.abs() < 1e-6);
        assert!((angle - expected).abs() < 1e-4, "angle = {}, expected = {}", angle, expected);
    }
}
