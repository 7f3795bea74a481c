//! 动画关键帧

use glam::{Vec3, Quat};

use super::bezier_curve::VmdBezier;

/// 按帧索引排序的关键帧
pub trait Keyframe {
    fn frame_index(&self) -> u32;
}

/// 骨骼关键帧
///
/// 平移与旋转已转换到右手坐标系；插值曲线描述从上一关键帧到本关键帧的区间。
#[derive(Clone, Debug, PartialEq)]
pub struct BoneKeyframe {
    pub frame_index: u32,
    pub translation: Vec3,
    pub orientation: Quat,
    pub interpolation_x: VmdBezier,
    pub interpolation_y: VmdBezier,
    pub interpolation_z: VmdBezier,
    pub interpolation_r: VmdBezier,
}

impl BoneKeyframe {
    pub fn new(frame_index: u32) -> Self {
        Self {
            frame_index,
            translation: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            interpolation_x: VmdBezier::default(),
            interpolation_y: VmdBezier::default(),
            interpolation_z: VmdBezier::default(),
            interpolation_r: VmdBezier::default(),
        }
    }
}

impl Keyframe for BoneKeyframe {
    #[inline]
    fn frame_index(&self) -> u32 {
        self.frame_index
    }
}

/// Morph 关键帧
#[derive(Clone, Debug, PartialEq)]
pub struct MorphKeyframe {
    pub frame_index: u32,
    pub weight: f32,
}

impl Keyframe for MorphKeyframe {
    #[inline]
    fn frame_index(&self) -> u32 {
        self.frame_index
    }
}

/// IK 启用关键帧
#[derive(Clone, Debug, PartialEq)]
pub struct IkKeyframe {
    pub frame_index: u32,
    pub enabled: bool,
}

impl Keyframe for IkKeyframe {
    #[inline]
    fn frame_index(&self) -> u32 {
        self.frame_index
    }
}

/// 相机关键帧（文件原值）
#[derive(Clone, Debug, PartialEq)]
pub struct CameraKeyframe {
    pub frame_index: u32,
    pub distance: f32,
    pub interest: Vec3,
    pub rotation: Vec3,
    /// X, Y, Z, 旋转, 距离, 视角 各 4 字节
    pub interpolation: [u8; 24],
    pub view_angle: u32,
    pub perspective: bool,
}

/// 照明关键帧（文件原值）
#[derive(Clone, Debug, PartialEq)]
pub struct LightKeyframe {
    pub frame_index: u32,
    pub color: Vec3,
    pub position: Vec3,
}

/// 自阴影关键帧
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowKeyframe {
    pub frame_index: u32,
    pub mode: u8,
    pub distance: f32,
}
