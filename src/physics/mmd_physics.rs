//! MMD 物理世界管理器
//!
//! 使用 Rapier3D 引擎，物理与动画共用右手坐标系。
//! 流程：build_physics → 每帧 [sync_bodies → step_simulation → sync_bones]

use std::collections::HashSet;
use std::num::NonZeroUsize;

use glam::Mat4;
use rapier3d::prelude::*;

use crate::pmx::{PmxJoint, PmxRigidBody};
use crate::skeleton::BoneSet;
use crate::{MmdError, Result};

use super::config::{get_config, PhysicsConfig};
use super::convert::{isometry_to_mat4, mat4_to_isometry};
use super::joint::MmdJoint;
use super::motion_state::MotionKind;
use super::rigid_body::{CollisionFilter, MmdRigidBody};

/// 碰撞过滤钩子
///
/// 所有碰撞体的 InteractionGroups 都是全开的，真正的组 / 掩码判定在这里完成，
/// 地面不受掩码限制。
struct MmdCollisionHooks;

impl PhysicsHooks for MmdCollisionHooks {
    fn filter_contact_pair(&self, context: &PairFilterContext) -> Option<SolverFlags> {
        let a = context.colliders.get(context.collider1)?;
        let b = context.colliders.get(context.collider2)?;
        let filter_a = CollisionFilter::from_user_data(a.user_data);
        let filter_b = CollisionFilter::from_user_data(b.user_data);
        filter_a
            .should_collide(&filter_b)
            .then_some(SolverFlags::COMPUTE_IMPULSES)
    }
}

/// MMD 物理世界管理器
pub struct MmdPhysics {
    /// MMD 刚体列表（与 PMX 刚体一一对应）
    pub rigid_bodies: Vec<MmdRigidBody>,
    /// MMD 关节列表（跳过的关节不在其中）
    pub joints: Vec<MmdJoint>,

    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    ccd_solver: CCDSolver,
    pipeline: PhysicsPipeline,
    params: IntegrationParameters,
    hooks: MmdCollisionHooks,
    gravity: Vector<Real>,

    config: PhysicsConfig,
    /// 未消耗的时间
    accumulator: f32,
    ground: Option<ColliderHandle>,
    /// 动态刚体关联的骨骼索引集合（构建时计算一次）
    dynamic_bone_indices: HashSet<usize>,
}

impl MmdPhysics {
    /// 使用全局配置创建空的物理世界
    pub fn new() -> Self {
        Self::with_config(get_config())
    }

    pub fn with_config(config: PhysicsConfig) -> Self {
        let mut params = IntegrationParameters::default();
        params.dt = config.fixed_time_step();
        params.num_solver_iterations =
            NonZeroUsize::new(config.solver_iterations).unwrap_or(NonZeroUsize::MIN);
        params.num_internal_pgs_iterations = config.pgs_iterations.max(1);

        let mut colliders = ColliderSet::new();
        let ground = config.ground_enabled.then(|| {
            let collider = ColliderBuilder::halfspace(Vector::y_axis())
                .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS)
                .user_data(CollisionFilter::GROUND.to_user_data())
                .build();
            colliders.insert(collider)
        });

        if config.debug_log {
            log::info!(
                "[Rapier] 物理世界创建: FPS={}, 重力Y={}, 地面={}",
                config.physics_fps,
                config.gravity_y,
                ground.is_some()
            );
        }

        Self {
            rigid_bodies: Vec::new(),
            joints: Vec::new(),
            bodies: RigidBodySet::new(),
            colliders,
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            ccd_solver: CCDSolver::new(),
            pipeline: PhysicsPipeline::new(),
            params,
            hooks: MmdCollisionHooks,
            gravity: Vector::new(0.0, config.gravity_y, 0.0),
            config,
            accumulator: 0.0,
            ground,
            dynamic_bone_indices: HashSet::new(),
        }
    }

    /// 构建物理系统
    ///
    /// 一次性创建所有刚体和关节。`bones` 需已计算绑定姿势。
    /// 形状参数非法或关节引用不存在的刚体时返回错误，整个模型不应继续加载。
    pub fn build_physics(
        &mut self,
        pmx_rigid_bodies: &[PmxRigidBody],
        pmx_joints: &[PmxJoint],
        bones: &BoneSet,
    ) -> Result<()> {
        self.rigid_bodies.reserve(pmx_rigid_bodies.len());

        // 第一步：创建所有刚体
        for (index, pmx_rb) in pmx_rigid_bodies.iter().enumerate() {
            let mut rb = match pmx_rb.bone {
                Some(bone) if bone >= bones.len() => {
                    log::warn!(
                        "刚体 {} '{}' 关联的骨骼 {} 不存在，按无骨骼处理",
                        index, pmx_rb.name, bone
                    );
                    let detached = PmxRigidBody { bone: None, ..pmx_rb.clone() };
                    MmdRigidBody::from_pmx(&detached, None)?
                }
                Some(bone) => {
                    let bone_global = bones.get_bone(bone).map(|b| b.local_to_world);
                    MmdRigidBody::from_pmx(pmx_rb, bone_global)?
                }
                None => MmdRigidBody::from_pmx(pmx_rb, None)?,
            };

            let handle = self.bodies.insert(rb.build_rigid_body(&self.config));
            let collider = rb.build_collider(&self.config);
            let collider_handle = self.colliders.insert_with_parent(collider, handle, &mut self.bodies);
            rb.rigid_body_handle = Some(handle);
            rb.collider_handle = Some(collider_handle);
            self.rigid_bodies.push(rb);
        }

        // 第二步：创建关节
        if self.config.joints_enabled {
            self.joints.reserve(pmx_joints.len());
            for (index, pmx_joint) in pmx_joints.iter().enumerate() {
                let body_count = self.rigid_bodies.len();
                let (a, b) = match (pmx_joint.rigid_body_a, pmx_joint.rigid_body_b) {
                    (Some(a), Some(b)) if a < body_count && b < body_count => (a, b),
                    (a, b) => {
                        return Err(MmdError::Physics(format!(
                            "joint {} '{}' references rigid bodies {:?} / {:?} (count {})",
                            index, pmx_joint.name, a, b, body_count
                        )));
                    }
                };
                if a == b {
                    log::warn!("关节 {} '{}' 两端为同一刚体 {}，跳过", index, pmx_joint.name, a);
                    continue;
                }

                let (Some(handle_a), Some(handle_b)) = (
                    self.rigid_bodies[a].rigid_body_handle,
                    self.rigid_bodies[b].rigid_body_handle,
                ) else {
                    continue;
                };

                let mut joint = MmdJoint::from_pmx(
                    pmx_joint,
                    a,
                    b,
                    self.rigid_bodies[a].motion_state.initial,
                    self.rigid_bodies[b].motion_state.initial,
                );
                let generic = joint.build_joint(&self.config);
                joint.joint_handle = Some(self.impulse_joints.insert(handle_a, handle_b, generic, true));
                self.joints.push(joint);
            }
        }

        // 第三步：预计算动态骨骼索引集合
        self.dynamic_bone_indices = self
            .rigid_bodies
            .iter()
            .filter(|rb| rb.kind().reflects_to_bone())
            .filter_map(|rb| rb.bone_index)
            .collect();

        let count = |kind: MotionKind| self.rigid_bodies.iter().filter(|rb| rb.kind() == kind).count();
        log::info!(
            "物理构建完成: {} 刚体 ({}跟骨 + {}物理 + {}物理跟骨 + {}物理合并), {} 关节",
            self.rigid_bodies.len(),
            count(MotionKind::Kinematic),
            count(MotionKind::Dynamic),
            count(MotionKind::DynamicBone),
            count(MotionKind::DynamicBoneMerge),
            self.joints.len()
        );
        Ok(())
    }

    // ========================================
    // 每帧流程
    // ========================================

    /// 一次完整的物理更新，返回实际执行的子步数
    pub fn update_animation(&mut self, bones: &mut BoneSet, delta_time: f32) -> u32 {
        self.sync_bodies(bones);
        let steps = self.step_simulation(delta_time);
        self.sync_bones(bones);
        steps
    }

    /// 同步运动学刚体位置
    ///
    /// 在物理步进前调用，目标为骨骼全局变换 × 偏移。
    pub fn sync_bodies(&mut self, bones: &BoneSet) {
        for rb in &self.rigid_bodies {
            let bone_global = rb.bone_index.and_then(|i| bones.get_bone(i)).map(|b| b.local_to_world);
            let Some(target) = rb.motion_state.kinematic_target(bone_global) else {
                continue;
            };
            if let Some(body) = rb.rigid_body_handle.and_then(|h| self.bodies.get_mut(h)) {
                body.set_next_kinematic_position(mat4_to_isometry(target));
            }
        }
    }

    /// 固定步长推进模拟，子步数受 max_substep_count 限制，超出部分丢弃
    pub fn step_simulation(&mut self, delta_time: f32) -> u32 {
        let fixed = self.config.fixed_time_step();
        self.accumulator += delta_time.max(0.0);

        let wanted = (self.accumulator / fixed).floor();
        self.accumulator -= wanted * fixed;
        let steps = (wanted as u32).min(self.config.max_substep_count);

        for _ in 0..steps {
            self.step_once(fixed);
        }
        if steps > 0 {
            self.clamp_velocities();
        }

        if self.config.debug_log {
            log::debug!("物理步进: dt={:.4}, 子步={}, 剩余={:.4}", delta_time, steps, self.accumulator);
        }
        steps
    }

    fn step_once(&mut self, dt: f32) {
        self.params.dt = dt;
        self.pipeline.step(
            &self.gravity,
            &self.params,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            None,
            &self.hooks,
            &(),
        );
    }

    /// 速度钳制，防止卡顿帧或极端力导致的物理爆炸
    fn clamp_velocities(&mut self) {
        let max_lin = self.config.max_linear_velocity;
        let max_ang = self.config.max_angular_velocity;

        for rb in &self.rigid_bodies {
            if rb.kind().is_kinematic() {
                continue;
            }
            let Some(body) = rb.rigid_body_handle.and_then(|h| self.bodies.get_mut(h)) else {
                continue;
            };

            let lin = *body.linvel();
            let lin_len = lin.norm();
            if lin_len > max_lin {
                body.set_linvel(lin * (max_lin / lin_len), true);
            }

            let ang = *body.angvel();
            let ang_len = ang.norm();
            if ang_len > max_ang {
                body.set_angvel(ang * (max_ang / ang_len), true);
            }
        }
    }

    /// 将动态刚体变换写回骨骼
    ///
    /// 先写入全部全局变换，再由全局反推本地变换，最后从根向下重新传播。
    pub fn sync_bones(&self, bones: &mut BoneSet) {
        let mut reflected = Vec::with_capacity(self.dynamic_bone_indices.len());

        for rb in &self.rigid_bodies {
            let Some(bone_index) = rb.bone_index else {
                continue;
            };
            let Some(body) = rb.rigid_body_handle.and_then(|h| self.bodies.get(h)) else {
                continue;
            };
            let Some(bone) = bones.get_bone(bone_index) else {
                continue;
            };

            let rigid_world = isometry_to_mat4(body.position());
            if let Some(global) = rb.motion_state.reflect_global_transform(bone.local_to_world, rigid_world) {
                bones.set_global_transform(bone_index, global);
                reflected.push(bone_index);
            }
        }

        if reflected.is_empty() {
            return;
        }
        for &index in &reflected {
            bones.update_local_from_global(index);
        }
        bones.update_all_global_transforms();
    }

    /// 重置物理
    ///
    /// 所有刚体暂时切为运动学，移动到由当前骨骼推导的位置并清零速度，
    /// 推进一次 reset_step 后恢复动态刚体，并把结果写回骨骼。
    pub fn reset(&mut self, bones: &mut BoneSet) {
        self.accumulator = 0.0;

        for rb in &self.rigid_bodies {
            let bone_global = rb.bone_index.and_then(|i| bones.get_bone(i)).map(|b| b.local_to_world);
            let target = mat4_to_isometry(rb.motion_state.reset_transform(bone_global));
            let Some(body) = rb.rigid_body_handle.and_then(|h| self.bodies.get_mut(h)) else {
                continue;
            };
            if !rb.kind().is_kinematic() {
                body.set_body_type(RigidBodyType::KinematicPositionBased, true);
            }
            body.set_position(target, true);
            body.set_next_kinematic_position(target);
            body.set_linvel(Vector::zeros(), true);
            body.set_angvel(Vector::zeros(), true);
        }

        let reset_step = self.config.reset_step;
        self.step_once(reset_step);

        for rb in &self.rigid_bodies {
            if rb.kind().is_kinematic() {
                continue;
            }
            if let Some(body) = rb.rigid_body_handle.and_then(|h| self.bodies.get_mut(h)) {
                body.set_body_type(RigidBodyType::Dynamic, true);
                body.set_linvel(Vector::zeros(), true);
                body.set_angvel(Vector::zeros(), true);
            }
        }

        self.sync_bones(bones);
    }

    // ========================================
    // 查询
    // ========================================

    /// 设置重力
    pub fn set_gravity(&mut self, x: f32, y: f32, z: f32) {
        self.gravity = Vector::new(x, y, z);
    }

    pub fn rigid_body_count(&self) -> usize {
        self.rigid_bodies.len()
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn has_ground(&self) -> bool {
        self.ground.is_some()
    }

    /// 物理结果会写回的骨骼索引
    pub fn dynamic_bone_indices(&self) -> &HashSet<usize> {
        &self.dynamic_bone_indices
    }

    /// 刚体当前世界变换
    pub fn rigid_body_transform(&self, index: usize) -> Option<Mat4> {
        let handle = self.rigid_bodies.get(index)?.rigid_body_handle?;
        self.bodies.get(handle).map(|body| isometry_to_mat4(body.position()))
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }
}

impl Default for MmdPhysics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::rigid_body::tests::pmx_body;
    use crate::pmx::{JointType, RigidBodyMode};
    use crate::test_util::init_logger;
    use crate::skeleton::BoneLink;
    use glam::Vec3;

    fn no_ground() -> PhysicsConfig {
        PhysicsConfig { ground_enabled: false, ..PhysicsConfig::default() }
    }

    fn one_bone(y: f32) -> BoneSet {
        let mut bones = BoneSet::new();
        let mut bone = BoneLink::new("root".to_string());
        bone.initial_position = Vec3::new(0.0, y, 0.0);
        bones.add_bone(bone);
        bones.build_bind_pose();
        bones
    }

    fn joint(a: Option<usize>, b: Option<usize>) -> PmxJoint {
        PmxJoint {
            name: "j".to_string(),
            name_en: String::new(),
            joint_type: JointType::Spring6Dof,
            rigid_body_a: a,
            rigid_body_b: b,
            position: Vec3::new(0.0, 1.0, 0.0),
            rotation: Vec3::ZERO,
            linear_lower: Vec3::ZERO,
            linear_upper: Vec3::ZERO,
            angular_lower: Vec3::splat(-0.5),
            angular_upper: Vec3::splat(0.5),
            linear_spring: Vec3::ZERO,
            angular_spring: Vec3::ZERO,
        }
    }

    fn body_y(physics: &MmdPhysics, index: usize) -> f32 {
        physics.rigid_body_transform(index).map(|m| m.w_axis.y).unwrap_or(f32::NAN)
    }

    #[test]
    fn test_free_body_falls() {
        let mut physics = MmdPhysics::with_config(no_ground());
        let mut bones = BoneSet::new();
        physics
            .build_physics(&[pmx_body("ball", RigidBodyMode::Dynamic, None, 10.0)], &[], &bones)
            .unwrap();

        for _ in 0..30 {
            physics.update_animation(&mut bones, 1.0 / 60.0);
        }
        assert!(body_y(&physics, 0) < 9.0);
    }

    #[test]
    fn test_substep_cap() {
        init_logger();
        let mut physics = MmdPhysics::with_config(no_ground());
        let mut bones = BoneSet::new();
        physics.build_physics(&[], &[], &bones).unwrap();

        assert_eq!(physics.update_animation(&mut bones, 1.0), 5);

        let mut physics = MmdPhysics::with_config(no_ground());
        physics.build_physics(&[], &[], &bones).unwrap();
        assert_eq!(physics.update_animation(&mut bones, 0.5 / 60.0), 0);
        assert_eq!(physics.update_animation(&mut bones, 0.6 / 60.0), 1);
    }

    #[test]
    fn test_kinematic_follows_bone() {
        let mut physics = MmdPhysics::with_config(no_ground());
        let mut bones = one_bone(1.0);
        physics
            .build_physics(&[pmx_body("head", RigidBodyMode::Static, Some(0), 1.5)], &[], &bones)
            .unwrap();

        bones.bones_mut()[0].animation_translate = Vec3::new(2.0, 0.0, 0.0);
        bones.begin_update();
        bones.update_local_transforms();
        bones.update_all_global_transforms();

        physics.update_animation(&mut bones, 1.0 / 60.0);
        let m = physics.rigid_body_transform(0).unwrap();
        assert!(m.w_axis.truncate().abs_diff_eq(Vec3::new(2.0, 1.5, 0.0), 1e-4));
        // 运动学刚体不回写骨骼
        assert!(physics.dynamic_bone_indices().is_empty());
    }

    #[test]
    fn test_dynamic_body_drives_bone() {
        let mut physics = MmdPhysics::with_config(no_ground());
        let mut bones = one_bone(5.0);
        physics
            .build_physics(&[pmx_body("tail", RigidBodyMode::Dynamic, Some(0), 5.0)], &[], &bones)
            .unwrap();
        assert!(physics.dynamic_bone_indices().contains(&0));

        for _ in 0..30 {
            physics.update_animation(&mut bones, 1.0 / 60.0);
        }
        let bone_y = bones.bones()[0].local_to_world.w_axis.y;
        assert!(bone_y < 4.5);
        assert!((bone_y - body_y(&physics, 0)).abs() < 1e-4);
    }

    #[test]
    fn test_ground_ignores_collision_mask() {
        let mut physics = MmdPhysics::with_config(PhysicsConfig::default());
        let mut bones = BoneSet::new();
        let mut pmx = pmx_body("ball", RigidBodyMode::Dynamic, None, 2.0);
        pmx.collision_mask = 0;
        physics.build_physics(&[pmx], &[], &bones).unwrap();
        assert!(physics.has_ground());

        for _ in 0..180 {
            physics.update_animation(&mut bones, 1.0 / 60.0);
        }
        assert!(body_y(&physics, 0) > 0.0);
    }

    #[test]
    fn test_reset_restores_initial_pose() {
        let mut physics = MmdPhysics::with_config(no_ground());
        let mut bones = BoneSet::new();
        physics
            .build_physics(&[pmx_body("ball", RigidBodyMode::Dynamic, None, 10.0)], &[], &bones)
            .unwrap();
        for _ in 0..30 {
            physics.update_animation(&mut bones, 1.0 / 60.0);
        }

        physics.reset(&mut bones);
        assert!((body_y(&physics, 0) - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_joint_validation() {
        init_logger();
        let bones = BoneSet::new();
        let bodies = [
            pmx_body("a", RigidBodyMode::Static, None, 1.0),
            pmx_body("b", RigidBodyMode::Dynamic, None, 0.5),
        ];

        let mut physics = MmdPhysics::with_config(no_ground());
        physics.build_physics(&bodies, &[joint(Some(0), Some(1))], &bones).unwrap();
        assert_eq!(physics.joint_count(), 1);

        let mut physics = MmdPhysics::with_config(no_ground());
        physics.build_physics(&bodies, &[joint(Some(1), Some(1))], &bones).unwrap();
        assert_eq!(physics.joint_count(), 0);

        let mut physics = MmdPhysics::with_config(no_ground());
        let result = physics.build_physics(&bodies, &[joint(Some(0), Some(7))], &bones);
        assert!(matches!(result, Err(MmdError::Physics(_))));
    }

    #[test]
    fn test_missing_bone_detaches_body() {
        init_logger();
        let mut physics = MmdPhysics::with_config(no_ground());
        let bones = one_bone(0.0);
        physics
            .build_physics(&[pmx_body("stray", RigidBodyMode::Dynamic, Some(9), 1.0)], &[], &bones)
            .unwrap();
        assert_eq!(physics.rigid_bodies[0].bone_index, None);
        assert_eq!(physics.rigid_bodies[0].kind(), MotionKind::Dynamic);
    }
}
