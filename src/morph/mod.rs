//! Morph 系统
//!
//! Morph 数据在加载时从 PMX 转换完成（坐标系已翻转、越界索引已剔除），
//! 运行时只做权重累加。

mod manager;

pub use manager::{MorphBuffers, MorphManager};

use glam::{Quat, Vec3, Vec4};

// ============================================================================
// 偏移数据
// ============================================================================

/// 顶点位置偏移
#[derive(Clone, Debug, PartialEq)]
pub struct VertexMorphOffset {
    pub vertex_index: usize,
    pub offset: Vec3,
}

/// UV 偏移（只使用 xy）
#[derive(Clone, Debug, PartialEq)]
pub struct UvMorphOffset {
    pub vertex_index: usize,
    pub offset: Vec4,
}

/// 骨骼偏移
#[derive(Clone, Debug, PartialEq)]
pub struct BoneMorphOffset {
    pub bone_index: usize,
    pub translation: Vec3,
    pub rotation: Quat,
}

/// 材质运算方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialMorphOp {
    Multiply,
    Add,
}

/// 材质偏移
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialMorphOffset {
    /// None 表示全部材质
    pub material_index: Option<usize>,
    pub operation: MaterialMorphOp,
    pub factor: MaterialFactor,
}

/// Group Morph 子项
#[derive(Clone, Debug, PartialEq)]
pub struct GroupMorphOffset {
    /// 加载时检测到循环引用会被置为 None
    pub morph_index: Option<usize>,
    pub influence: f32,
}

// ============================================================================
// 材质系数
// ============================================================================

/// 材质系数
///
/// 乘算累加器初始为全 1，加算累加器初始为全 0；
/// 最终值 = 初始值 * 乘算 + 加算。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialFactor {
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

impl MaterialFactor {
    /// 乘算单位元
    pub const ONE: Self = Self {
        diffuse: Vec4::ONE,
        specular: Vec3::ONE,
        specular_power: 1.0,
        ambient: Vec3::ONE,
        edge_color: Vec4::ONE,
        edge_size: 1.0,
        texture_factor: Vec4::ONE,
        sphere_texture_factor: Vec4::ONE,
        toon_texture_factor: Vec4::ONE,
    };

    /// 加算单位元
    pub const ZERO: Self = Self {
        diffuse: Vec4::ZERO,
        specular: Vec3::ZERO,
        specular_power: 0.0,
        ambient: Vec3::ZERO,
        edge_color: Vec4::ZERO,
        edge_size: 0.0,
        texture_factor: Vec4::ZERO,
        sphere_texture_factor: Vec4::ZERO,
        toon_texture_factor: Vec4::ZERO,
    };

    /// 乘算混合：x *= 1 + (v - 1) * w
    pub fn apply_multiply(&mut self, offset: &MaterialFactor, weight: f32) {
        let mul4 = |base: Vec4, target: Vec4| base * (Vec4::ONE + (target - Vec4::ONE) * weight);
        let mul3 = |base: Vec3, target: Vec3| base * (Vec3::ONE + (target - Vec3::ONE) * weight);
        self.diffuse = mul4(self.diffuse, offset.diffuse);
        self.specular = mul3(self.specular, offset.specular);
        self.specular_power *= 1.0 + (offset.specular_power - 1.0) * weight;
        self.ambient = mul3(self.ambient, offset.ambient);
        self.edge_color = mul4(self.edge_color, offset.edge_color);
        self.edge_size *= 1.0 + (offset.edge_size - 1.0) * weight;
        self.texture_factor = mul4(self.texture_factor, offset.texture_factor);
        self.sphere_texture_factor = mul4(self.sphere_texture_factor, offset.sphere_texture_factor);
        self.toon_texture_factor = mul4(self.toon_texture_factor, offset.toon_texture_factor);
    }

    /// 加算混合：x += v * w
    pub fn apply_additive(&mut self, offset: &MaterialFactor, weight: f32) {
        self.diffuse += offset.diffuse * weight;
        self.specular += offset.specular * weight;
        self.specular_power += offset.specular_power * weight;
        self.ambient += offset.ambient * weight;
        self.edge_color += offset.edge_color * weight;
        self.edge_size += offset.edge_size * weight;
        self.texture_factor += offset.texture_factor * weight;
        self.sphere_texture_factor += offset.sphere_texture_factor * weight;
        self.toon_texture_factor += offset.toon_texture_factor * weight;
    }
}

impl Default for MaterialFactor {
    fn default() -> Self {
        Self::ONE
    }
}

// ============================================================================
// Morph
// ============================================================================

/// Morph 种类
#[derive(Clone, Debug, PartialEq)]
pub enum MorphKind {
    Position(Vec<VertexMorphOffset>),
    Uv(Vec<UvMorphOffset>),
    Material(Vec<MaterialMorphOffset>),
    Bone(Vec<BoneMorphOffset>),
    Group(Vec<GroupMorphOffset>),
    /// 翻转 / 冲量 / 追加 UV，保留名字与权重但不参与计算
    Unsupported,
}

/// Morph
#[derive(Clone, Debug)]
pub struct Morph {
    pub name: String,
    pub kind: MorphKind,
    /// 当前权重（不做范围限制）
    pub weight: f32,
    /// 基础动画权重（交叉淡入用）
    pub base_animation_weight: f32,
}

impl Morph {
    pub fn new(name: String, kind: MorphKind) -> Self {
        Self {
            name,
            kind,
            weight: 0.0,
            base_animation_weight: 0.0,
        }
    }

    #[inline]
    pub fn set_weight(&mut self, weight: f32) {
        self.weight = weight;
    }

    #[inline]
    pub fn reset(&mut self) {
        self.weight = 0.0;
    }

    #[inline]
    pub fn save_base_animation(&mut self) {
        self.base_animation_weight = self.weight;
    }

    #[inline]
    pub fn load_base_animation(&mut self) {
        self.weight = self.base_animation_weight;
    }

    #[inline]
    pub fn clear_base_animation(&mut self) {
        self.base_animation_weight = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiply_matches_lerp() {
        let mut f = MaterialFactor::ONE;
        let mut offset = MaterialFactor::ONE;
        offset.diffuse = Vec4::new(0.0, 0.5, 2.0, 1.0);
        f.apply_multiply(&offset, 0.5);
        // lerp(1, v, 0.5)
        assert!(f.diffuse.abs_diff_eq(Vec4::new(0.5, 0.75, 1.5, 1.0), 1e-6));
        assert_eq!(f.specular, Vec3::ONE);
    }

    #[test]
    fn test_additive_accumulates() {
        let mut f = MaterialFactor::ZERO;
        let mut offset = MaterialFactor::ZERO;
        offset.edge_size = 2.0;
        f.apply_additive(&offset, 0.25);
        f.apply_additive(&offset, 0.25);
        assert!((f.edge_size - 1.0).abs() < 1e-6);
    }
}
