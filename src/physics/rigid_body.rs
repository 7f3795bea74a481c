//! MMD 刚体
//!
//! 保存 PMX 刚体参数、同步状态以及 Rapier 中的句柄。

use glam::{Mat4, Vec3};
use rapier3d::prelude::*;

use crate::pmx::{PmxRigidBody, RigidBodyShape};
use crate::{MmdError, Result};

use super::config::PhysicsConfig;
use super::convert::{mat4_to_isometry, rigid_body_matrix};
use super::motion_state::{MotionKind, MotionState};

/// 碰撞过滤信息，打包进碰撞体的 user_data
///
/// 物理引擎的碰撞组全部放开，由钩子按 MMD 规则过滤：
/// 地面与任何刚体碰撞，其他刚体要求双方的组与掩码互相匹配。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionFilter {
    /// 所属组位 (1 << group)
    pub group: u16,
    /// 可碰撞组掩码
    pub mask: u16,
    pub ground: bool,
}

impl CollisionFilter {
    const GROUND_BIT: u128 = 1 << 32;

    pub const GROUND: Self = Self {
        group: 0xFFFF,
        mask: 0xFFFF,
        ground: true,
    };

    pub fn new(group: u8, mask: u16) -> Self {
        Self {
            group: 1u16 << group.min(15),
            mask,
            ground: false,
        }
    }

    pub fn to_user_data(self) -> u128 {
        let mut data = self.group as u128 | ((self.mask as u128) << 16);
        if self.ground {
            data |= Self::GROUND_BIT;
        }
        data
    }

    pub fn from_user_data(data: u128) -> Self {
        Self {
            group: (data & 0xFFFF) as u16,
            mask: ((data >> 16) & 0xFFFF) as u16,
            ground: data & Self::GROUND_BIT != 0,
        }
    }

    /// 两个碰撞体是否应当产生接触
    pub fn should_collide(&self, other: &CollisionFilter) -> bool {
        if self.ground || other.ground {
            return true;
        }
        (self.group & other.mask) != 0 && (other.group & self.mask) != 0
    }
}

/// MMD 刚体
#[derive(Debug, Clone)]
pub struct MmdRigidBody {
    /// 刚体名称
    pub name: String,
    /// 关联的骨骼索引
    pub bone_index: Option<usize>,
    /// 同步状态
    pub motion_state: MotionState,
    pub filter: CollisionFilter,
    pub shape: RigidBodyShape,
    pub size: Vec3,
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
    /// 刚体句柄
    pub rigid_body_handle: Option<RigidBodyHandle>,
    /// 碰撞体句柄
    pub collider_handle: Option<ColliderHandle>,
}

impl MmdRigidBody {
    /// 从 PMX 刚体数据创建
    ///
    /// `bone_global` 为关联骨骼在绑定姿势下的全局变换。
    /// 形状尺寸非法（非有限值或非正）时返回错误。
    pub fn from_pmx(pmx: &PmxRigidBody, bone_global: Option<Mat4>) -> Result<Self> {
        validate(pmx)?;

        let world = rigid_body_matrix(pmx.position, pmx.rotation);
        let kind = MotionKind::from_mode(pmx.mode, bone_global.is_some());

        let mut mass = pmx.mass;
        if !kind.is_kinematic() && mass <= 0.0 {
            log::warn!("刚体 '{}' 质量为 {}，使用 1.0", pmx.name, mass);
            mass = 1.0;
        }

        Ok(Self {
            name: pmx.name.clone(),
            bone_index: pmx.bone,
            motion_state: MotionState::new(kind, world, bone_global),
            filter: CollisionFilter::new(pmx.group, pmx.collision_mask),
            shape: pmx.shape,
            size: pmx.size,
            mass,
            linear_damping: pmx.linear_damping,
            angular_damping: pmx.angular_damping,
            restitution: pmx.restitution,
            friction: pmx.friction,
            rigid_body_handle: None,
            collider_handle: None,
        })
    }

    #[inline]
    pub fn kind(&self) -> MotionKind {
        self.motion_state.kind
    }

    /// 创建 Rapier 刚体
    pub fn build_rigid_body(&self, config: &PhysicsConfig) -> RigidBody {
        let body_type = if self.kind().is_kinematic() {
            RigidBodyType::KinematicPositionBased
        } else {
            RigidBodyType::Dynamic
        };

        RigidBodyBuilder::new(body_type)
            .position(mat4_to_isometry(self.motion_state.initial))
            .linear_damping(self.linear_damping * config.linear_damping_scale)
            .angular_damping(self.angular_damping * config.angular_damping_scale)
            .ccd_enabled(false)
            .can_sleep(false)
            .build()
    }

    /// 创建 Rapier 碰撞体
    pub fn build_collider(&self, config: &PhysicsConfig) -> Collider {
        let shape = match self.shape {
            RigidBodyShape::Sphere => SharedShape::ball(self.size.x),
            RigidBodyShape::Box => SharedShape::cuboid(self.size.x, self.size.y, self.size.z),
            // 半径 + 圆柱部分高度，沿 Y 轴
            RigidBodyShape::Capsule => SharedShape::capsule_y(self.size.y * 0.5, self.size.x),
        };

        let builder = ColliderBuilder::new(shape)
            .restitution(self.restitution)
            .friction(self.friction)
            .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS)
            .user_data(self.filter.to_user_data());

        let builder = if self.kind().is_kinematic() {
            builder.density(0.0)
        } else {
            builder.mass(self.mass * config.mass_scale)
        };

        builder.build()
    }
}

fn validate(pmx: &PmxRigidBody) -> Result<()> {
    let size = pmx.size;
    let size_ok = match pmx.shape {
        RigidBodyShape::Sphere => size.x > 0.0,
        RigidBodyShape::Box => size.x > 0.0 && size.y > 0.0 && size.z > 0.0,
        RigidBodyShape::Capsule => size.x > 0.0 && size.y >= 0.0,
    };
    if !size_ok || !size.is_finite() {
        return Err(MmdError::Physics(format!(
            "rigid body '{}' has invalid {:?} size {:?}",
            pmx.name, pmx.shape, size
        )));
    }
    if !pmx.position.is_finite() || !pmx.rotation.is_finite() || !pmx.mass.is_finite() {
        return Err(MmdError::Physics(format!(
            "rigid body '{}' has non-finite transform or mass",
            pmx.name
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pmx::RigidBodyMode;

    pub(crate) fn pmx_body(name: &str, mode: RigidBodyMode, bone: Option<usize>, y: f32) -> PmxRigidBody {
        PmxRigidBody {
            name: name.to_string(),
            name_en: String::new(),
            bone,
            group: 1,
            collision_mask: 0xFFFF,
            shape: RigidBodyShape::Sphere,
            size: Vec3::new(0.5, 0.0, 0.0),
            position: Vec3::new(0.0, y, 0.0),
            rotation: Vec3::ZERO,
            mass: 1.0,
            linear_damping: 0.5,
            angular_damping: 0.5,
            restitution: 0.0,
            friction: 0.5,
            mode,
        }
    }

    #[test]
    fn test_filter_round_trip() {
        let filter = CollisionFilter::new(3, 0b1111_0111);
        assert_eq!(CollisionFilter::from_user_data(filter.to_user_data()), filter);
        assert_eq!(CollisionFilter::from_user_data(CollisionFilter::GROUND.to_user_data()), CollisionFilter::GROUND);
    }

    #[test]
    fn test_filter_rules() {
        let a = CollisionFilter::new(0, 0xFFFF & !(1 << 1));
        let b = CollisionFilter::new(1, 0xFFFF);
        let c = CollisionFilter::new(2, 0xFFFF);
        assert!(!a.should_collide(&b));
        assert!(!b.should_collide(&a));
        assert!(a.should_collide(&c));

        let isolated = CollisionFilter::new(4, 0);
        assert!(!isolated.should_collide(&c));
        assert!(isolated.should_collide(&CollisionFilter::GROUND));
    }

    #[test]
    fn test_invalid_shape_is_fatal() {
        let mut pmx = pmx_body("bad", RigidBodyMode::Dynamic, None, 1.0);
        pmx.size = Vec3::ZERO;
        assert!(matches!(MmdRigidBody::from_pmx(&pmx, None), Err(MmdError::Physics(_))));

        let mut pmx = pmx_body("nan", RigidBodyMode::Dynamic, None, 1.0);
        pmx.position.x = f32::NAN;
        assert!(MmdRigidBody::from_pmx(&pmx, None).is_err());
    }

    #[test]
    fn test_offset_relative_to_bone() {
        let pmx = pmx_body("head", RigidBodyMode::Static, Some(0), 1.5);
        let bone = Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0));
        let body = MmdRigidBody::from_pmx(&pmx, Some(bone)).unwrap();
        assert_eq!(body.kind(), MotionKind::Kinematic);
        assert!(body.motion_state.offset.w_axis.truncate().abs_diff_eq(Vec3::new(0.0, 0.5, 0.0), 1e-6));
    }
}
