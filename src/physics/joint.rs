//! MMD 关节（6DOF 弹簧约束）
//!
//! 用 Rapier 的 GenericJoint 配合 limits 与 position motor 表达。

use glam::{Mat4, Vec3};
use rapier3d::prelude::*;

use crate::pmx::{JointType, PmxJoint};

use super::config::PhysicsConfig;
use super::convert::{joint_matrix, mat4_to_isometry};

/// 锁定判定容差
const LOCK_EPSILON: f32 = 1.0e-4;

/// MMD 关节
#[derive(Debug, Clone)]
pub struct MmdJoint {
    /// 关节名称
    pub name: String,
    pub joint_type: JointType,
    pub rigid_body_a: usize,
    pub rigid_body_b: usize,
    /// 以下限制已转换到右手坐标系
    pub linear_lower: Vec3,
    pub linear_upper: Vec3,
    pub angular_lower: Vec3,
    pub angular_upper: Vec3,
    pub linear_spring: Vec3,
    pub angular_spring: Vec3,
    /// 关节在刚体 A / B 局部空间的变换
    pub local_frame_a: Mat4,
    pub local_frame_b: Mat4,
    /// 关节句柄
    pub joint_handle: Option<ImpulseJointHandle>,
}

impl MmdJoint {
    /// 从 PMX 关节数据创建
    ///
    /// `world_a` / `world_b` 为两个刚体的初始世界变换。
    /// Z 轴镜像后，X/Y 轴的旋转方向相反、Z 方向的平移相反，
    /// 对应的上下限取反并交换。
    pub fn from_pmx(pmx: &PmxJoint, a: usize, b: usize, world_a: Mat4, world_b: Mat4) -> Self {
        let joint_world = joint_matrix(pmx.position, pmx.rotation);

        let linear_lower = Vec3::new(pmx.linear_lower.x, pmx.linear_lower.y, -pmx.linear_upper.z);
        let linear_upper = Vec3::new(pmx.linear_upper.x, pmx.linear_upper.y, -pmx.linear_lower.z);
        let angular_lower = Vec3::new(-pmx.angular_upper.x, -pmx.angular_upper.y, pmx.angular_lower.z);
        let angular_upper = Vec3::new(-pmx.angular_lower.x, -pmx.angular_lower.y, pmx.angular_upper.z);

        Self {
            name: pmx.name.clone(),
            joint_type: pmx.joint_type,
            rigid_body_a: a,
            rigid_body_b: b,
            linear_lower,
            linear_upper,
            angular_lower,
            angular_upper,
            linear_spring: pmx.linear_spring,
            angular_spring: pmx.angular_spring,
            local_frame_a: world_a.inverse() * joint_world,
            local_frame_b: world_b.inverse() * joint_world,
            joint_handle: None,
        }
    }

    /// 上下限相等的平移轴直接锁定
    pub fn locked_axes(&self) -> JointAxesMask {
        let mut locked = JointAxesMask::empty();
        let pairs = [
            (JointAxesMask::LIN_X, self.linear_lower.x, self.linear_upper.x),
            (JointAxesMask::LIN_Y, self.linear_lower.y, self.linear_upper.y),
            (JointAxesMask::LIN_Z, self.linear_lower.z, self.linear_upper.z),
        ];
        for (mask, lower, upper) in pairs {
            if (upper - lower).abs() < LOCK_EPSILON {
                locked |= mask;
            }
        }
        locked
    }

    /// 创建 Rapier GenericJoint
    ///
    /// lower > upper 的轴不设限制；非零弹簧刚度用目标为 0 的 position motor 模拟。
    pub fn build_joint(&self, config: &PhysicsConfig) -> GenericJoint {
        let locked = self.locked_axes();

        let mut joint = GenericJointBuilder::new(locked)
            .local_frame1(mat4_to_isometry(self.local_frame_a))
            .local_frame2(mat4_to_isometry(self.local_frame_b))
            .contacts_enabled(false)
            .build();

        let linear = [
            (JointAxis::LinX, JointAxesMask::LIN_X, self.linear_lower.x, self.linear_upper.x, self.linear_spring.x),
            (JointAxis::LinY, JointAxesMask::LIN_Y, self.linear_lower.y, self.linear_upper.y, self.linear_spring.y),
            (JointAxis::LinZ, JointAxesMask::LIN_Z, self.linear_lower.z, self.linear_upper.z, self.linear_spring.z),
        ];
        for (axis, mask, lower, upper, spring) in linear {
            if locked.contains(mask) {
                continue;
            }
            if lower <= upper {
                joint.set_limits(axis, [lower, upper]);
            }
            if spring != 0.0 {
                let (stiffness, damping) = spring_params(spring, config);
                joint.set_motor_position(axis, 0.0, stiffness, damping);
            }
        }

        let angular = [
            (JointAxis::AngX, self.angular_lower.x, self.angular_upper.x, self.angular_spring.x),
            (JointAxis::AngY, self.angular_lower.y, self.angular_upper.y, self.angular_spring.y),
            (JointAxis::AngZ, self.angular_lower.z, self.angular_upper.z, self.angular_spring.z),
        ];
        for (axis, lower, upper, spring) in angular {
            if lower <= upper {
                joint.set_limits(axis, [lower, upper]);
            }
            if spring != 0.0 {
                let (stiffness, damping) = spring_params(spring, config);
                joint.set_motor_position(axis, 0.0, stiffness, damping);
            }
        }

        joint
    }
}

fn spring_params(spring: f32, config: &PhysicsConfig) -> (f32, f32) {
    let stiffness = spring.abs() * config.spring_stiffness_scale;
    let damping = (stiffness * config.spring_damping_factor).sqrt();
    (stiffness, damping)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmx_joint() -> PmxJoint {
        PmxJoint {
            name: "j".to_string(),
            name_en: String::new(),
            joint_type: JointType::Spring6Dof,
            rigid_body_a: Some(0),
            rigid_body_b: Some(1),
            position: Vec3::new(0.0, 1.0, 0.5),
            rotation: Vec3::ZERO,
            linear_lower: Vec3::new(0.0, 0.0, -0.1),
            linear_upper: Vec3::new(0.0, 0.2, 0.3),
            angular_lower: Vec3::new(-0.5, -0.25, -1.0),
            angular_upper: Vec3::new(0.1, 0.75, 0.2),
            linear_spring: Vec3::ZERO,
            angular_spring: Vec3::new(10.0, 0.0, 0.0),
        }
    }

    #[test]
    fn test_limits_mirrored() {
        let joint = MmdJoint::from_pmx(&pmx_joint(), 0, 1, Mat4::IDENTITY, Mat4::IDENTITY);
        assert_eq!(joint.linear_lower, Vec3::new(0.0, 0.0, -0.3));
        assert_eq!(joint.linear_upper, Vec3::new(0.0, 0.2, 0.1));
        assert_eq!(joint.angular_lower, Vec3::new(-0.1, -0.75, -1.0));
        assert_eq!(joint.angular_upper, Vec3::new(0.5, 0.25, 0.2));
    }

    #[test]
    fn test_local_frames() {
        let world_a = Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0));
        let world_b = Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0));
        let joint = MmdJoint::from_pmx(&pmx_joint(), 0, 1, world_a, world_b);
        // 关节位置 (0, 1, -0.5)
        let pos = Vec3::new(0.0, 1.0, -0.5);
        assert!((world_a * joint.local_frame_a).w_axis.truncate().abs_diff_eq(pos, 1e-6));
        assert!((world_b * joint.local_frame_b).w_axis.truncate().abs_diff_eq(pos, 1e-6));
    }

    #[test]
    fn test_locked_axes() {
        let joint = MmdJoint::from_pmx(&pmx_joint(), 0, 1, Mat4::IDENTITY, Mat4::IDENTITY);
        let locked = joint.locked_axes();
        assert!(locked.contains(JointAxesMask::LIN_X));
        assert!(!locked.contains(JointAxesMask::LIN_Y));
        assert!(!locked.contains(JointAxesMask::LIN_Z));
        let _ = joint.build_joint(&PhysicsConfig::default());
    }
}
