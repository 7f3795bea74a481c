//! PMX 模型数据
//!
//! 解析后的 PMX 结构体。坐标保持文件原样（MMD 左手坐标系），
//! Z 轴翻转由运行时模型构建时统一处理。
//!
//! 文件中的 -1 索引在读取时即转换为 `None`。

pub(crate) mod reader;

pub use reader::PmxReader;

use glam::{Vec2, Vec3, Vec4};
use bitflags::bitflags;

use crate::Result;

// ============================================================================
// 头部
// ============================================================================

/// 文本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf16Le,
    Utf8,
}

/// PMX 头部信息
#[derive(Clone, Debug)]
pub struct PmxHeader {
    /// 版本号（2.0 / 2.1）
    pub version: f32,
    pub encoding: TextEncoding,
    /// 追加 UV 数 (0~4)
    pub additional_uv_count: u8,
    pub vertex_index_size: u8,
    pub texture_index_size: u8,
    pub material_index_size: u8,
    pub bone_index_size: u8,
    pub morph_index_size: u8,
    pub rigid_body_index_size: u8,
}

/// 模型信息
#[derive(Clone, Debug, Default)]
pub struct PmxModelInfo {
    pub name: String,
    pub name_en: String,
    pub comment: String,
    pub comment_en: String,
}

// ============================================================================
// 顶点
// ============================================================================

/// 顶点权重
#[derive(Clone, Debug, PartialEq)]
pub enum PmxVertexWeight {
    Bdef1 { bone: Option<usize> },
    Bdef2 { bones: [Option<usize>; 2], weight: f32 },
    Bdef4 { bones: [Option<usize>; 4], weights: [f32; 4] },
    Sdef {
        bones: [Option<usize>; 2],
        weight: f32,
        c: Vec3,
        r0: Vec3,
        r1: Vec3,
    },
    Qdef { bones: [Option<usize>; 4], weights: [f32; 4] },
}

#[derive(Clone, Debug)]
pub struct PmxVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub additional_uvs: Vec<Vec4>,
    pub weight: PmxVertexWeight,
    pub edge_scale: f32,
}

// ============================================================================
// 材质
// ============================================================================

bitflags! {
    /// 材质绘制标志
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MaterialDrawFlags: u8 {
        const NO_CULL = 1 << 0;
        const GROUND_SHADOW = 1 << 1;
        const CAST_SELF_SHADOW = 1 << 2;
        const RECEIVE_SELF_SHADOW = 1 << 3;
        const EDGE = 1 << 4;
        const VERTEX_COLOR = 1 << 5;
        const POINT = 1 << 6;
        const LINE = 1 << 7;
    }
}

/// 球面贴图模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SphereMode {
    #[default]
    None,
    Multiply,
    Add,
    SubTexture,
}

/// Toon 引用
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToonRef {
    /// 独立贴图
    Texture(Option<usize>),
    /// 共享 toon01~toon10
    Shared(u8),
}

#[derive(Clone, Debug)]
pub struct PmxMaterial {
    pub name: String,
    pub name_en: String,
    pub diffuse: Vec4,
    pub specular: Vec3,
    pub specular_power: f32,
    pub ambient: Vec3,
    pub draw_flags: MaterialDrawFlags,
    pub edge_color: Vec4,
    pub edge_size: f32,
    pub texture_index: Option<usize>,
    pub sphere_texture_index: Option<usize>,
    pub sphere_mode: SphereMode,
    pub toon: ToonRef,
    pub memo: String,
    /// 该材质使用的索引数
    pub index_count: u32,
}

// ============================================================================
// 骨骼
// ============================================================================

bitflags! {
    /// PMX 骨骼标志（文件原始位）
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PmxBoneFlags: u16 {
        const CONNECTION = 0x0001;
        const ROTATABLE = 0x0002;
        const MOVABLE = 0x0004;
        const VISIBLE = 0x0008;
        const OPERABLE = 0x0010;
        const IK = 0x0020;
        const APPEND_LOCAL = 0x0080;
        const APPEND_ROTATE = 0x0100;
        const APPEND_TRANSLATE = 0x0200;
        const FIXED_AXIS = 0x0400;
        const LOCAL_AXIS = 0x0800;
        const DEFORM_AFTER_PHYSICS = 0x1000;
        const EXTERNAL_PARENT = 0x2000;
    }
}

/// 骨骼尾端
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoneTail {
    Bone(Option<usize>),
    Offset(Vec3),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PmxIkLink {
    pub bone: Option<usize>,
    /// (下限, 上限)，文件原值
    pub limits: Option<(Vec3, Vec3)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PmxIk {
    pub target: Option<usize>,
    pub loop_count: i32,
    pub limit_angle: f32,
    pub links: Vec<PmxIkLink>,
}

#[derive(Clone, Debug)]
pub struct PmxBone {
    pub name: String,
    pub name_en: String,
    pub position: Vec3,
    pub parent: Option<usize>,
    pub deform_depth: i32,
    pub flags: PmxBoneFlags,
    pub tail: BoneTail,
    /// 附加变换 (父骨骼, 比率)
    pub append: Option<(Option<usize>, f32)>,
    pub fixed_axis: Option<Vec3>,
    /// 本地轴 (X, Z)
    pub local_axis: Option<(Vec3, Vec3)>,
    pub external_parent_key: Option<i32>,
    pub ik: Option<PmxIk>,
}

// ============================================================================
// Morph
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MorphPanel {
    System,
    Eyebrow,
    Eye,
    Mouth,
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PmxGroupOffset {
    pub morph: Option<usize>,
    pub weight: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PmxVertexOffset {
    pub vertex: usize,
    pub offset: Vec3,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PmxBoneOffset {
    pub bone: Option<usize>,
    pub translation: Vec3,
    pub rotation: Vec4,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PmxUvOffset {
    pub vertex: usize,
    pub offset: Vec4,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PmxMaterialOffset {
    /// None 表示全部材质
    pub material: Option<usize>,
    /// 0 = 乘算, 1 = 加算
    pub operation: u8,
    pub diffuse: Vec4,
    pub specular: Vec3,
    pub specular_power: f32,
    pub ambient: Vec3,
    pub edge_color: Vec4,
    pub edge_size: f32,
    pub texture_factor: Vec4,
    pub sphere_texture_factor: Vec4,
    pub toon_texture_factor: Vec4,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PmxImpulseOffset {
    pub rigid_body: Option<usize>,
    pub local: bool,
    pub velocity: Vec3,
    pub torque: Vec3,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PmxMorphOffsets {
    Group(Vec<PmxGroupOffset>),
    Vertex(Vec<PmxVertexOffset>),
    Bone(Vec<PmxBoneOffset>),
    Uv(Vec<PmxUvOffset>),
    /// 追加 UV 1~4
    AdditionalUv(u8, Vec<PmxUvOffset>),
    Material(Vec<PmxMaterialOffset>),
    Flip(Vec<PmxGroupOffset>),
    Impulse(Vec<PmxImpulseOffset>),
}

#[derive(Clone, Debug)]
pub struct PmxMorph {
    pub name: String,
    pub name_en: String,
    pub panel: MorphPanel,
    pub offsets: PmxMorphOffsets,
}

// ============================================================================
// 刚体 / 关节
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RigidBodyShape {
    Sphere,
    Box,
    Capsule,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RigidBodyMode {
    /// 跟随骨骼
    Static,
    /// 物理演算
    Dynamic,
    /// 物理演算 + 骨骼位置合并
    DynamicWithBonePosition,
}

#[derive(Clone, Debug)]
pub struct PmxRigidBody {
    pub name: String,
    pub name_en: String,
    pub bone: Option<usize>,
    pub group: u8,
    /// 非碰撞组掩码（按位为 1 表示可碰撞）
    pub collision_mask: u16,
    pub shape: RigidBodyShape,
    pub size: Vec3,
    pub position: Vec3,
    pub rotation: Vec3,
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
    pub mode: RigidBodyMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JointType {
    Spring6Dof,
    SixDof,
    P2p,
    ConeTwist,
    Slider,
    Hinge,
}

#[derive(Clone, Debug)]
pub struct PmxJoint {
    pub name: String,
    pub name_en: String,
    pub joint_type: JointType,
    pub rigid_body_a: Option<usize>,
    pub rigid_body_b: Option<usize>,
    pub position: Vec3,
    pub rotation: Vec3,
    pub linear_lower: Vec3,
    pub linear_upper: Vec3,
    pub angular_lower: Vec3,
    pub angular_upper: Vec3,
    pub linear_spring: Vec3,
    pub angular_spring: Vec3,
}

// ============================================================================
// 模型
// ============================================================================

/// 解析后的 PMX 模型
#[derive(Clone, Debug)]
pub struct PmxModel {
    pub header: PmxHeader,
    pub info: PmxModelInfo,
    pub vertices: Vec<PmxVertex>,
    pub indices: Vec<u32>,
    pub textures: Vec<String>,
    pub materials: Vec<PmxMaterial>,
    pub bones: Vec<PmxBone>,
    pub morphs: Vec<PmxMorph>,
    pub rigid_bodies: Vec<PmxRigidBody>,
    pub joints: Vec<PmxJoint>,
}

impl PmxModel {
    /// 从文件路径加载
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::load_from_bytes(&bytes)
    }

    /// 从字节加载
    pub fn load_from_bytes(bytes: &[u8]) -> Result<Self> {
        PmxReader::new(bytes).read_model()
    }
}
