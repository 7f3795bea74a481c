//! 顶点蒙皮计算

mod skinning;

pub use skinning::{compute_skinning, skin_vertex, SkinningContext};

use glam::{Mat4, Vec2, Vec3, Vec4};

/// 运行时顶点骨骼权重
///
/// 骨骼索引在加载时已校验，一定在骨骼数组范围内。
#[derive(Clone, Debug, PartialEq)]
pub enum VertexWeight {
    Bdef1 { bone: usize },
    Bdef2 { bones: [usize; 2], weight: f32 },
    Bdef4 { bones: [usize; 4], weights: [f32; 4] },
    /// `cr0` / `cr1` 为加载时修正后的 (C + R0') / 2 与 (C + R1') / 2
    Sdef {
        bones: [usize; 2],
        weight: f32,
        c: Vec3,
        cr0: Vec3,
        cr1: Vec3,
    },
    /// 双四元数蒙皮
    Qdef { bones: [usize; 4], weights: [f32; 4] },
}

impl VertexWeight {
    /// 由 PMX 的 SDEF 参数构建，修正 R0 / R1 使加权中心与 C 重合
    pub fn sdef(bones: [usize; 2], weight: f32, c: Vec3, r0: Vec3, r1: Vec3) -> Self {
        let w0 = weight;
        let w1 = 1.0 - weight;
        let rw = r0 * w0 + r1 * w1;
        let r0 = c + r0 - rw;
        let r1 = c + r1 - rw;
        VertexWeight::Sdef {
            bones,
            weight,
            c,
            cr0: (c + r0) * 0.5,
            cr1: (c + r1) * 0.5,
        }
    }
}

impl Default for VertexWeight {
    fn default() -> Self {
        VertexWeight::Bdef1 { bone: 0 }
    }
}

/// 运行时顶点（已转换为右手坐标系，V 轴已翻转）
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RuntimeVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

/// 蒙皮输入数据
pub struct SkinningInput<'a> {
    /// 静止姿势顶点
    pub vertices: &'a [RuntimeVertex],
    /// 顶点权重
    pub weights: &'a [VertexWeight],
    /// 骨骼变换矩阵（已乘以逆绑定矩阵）
    pub bone_matrices: &'a [Mat4],
    /// Morph 顶点偏移，在蒙皮前叠加；为空表示没有
    pub position_offsets: &'a [Vec3],
    /// Morph UV 偏移，只使用 xy
    pub uv_offsets: &'a [Vec4],
}

/// 蒙皮输出数据
#[derive(Clone, Debug, Default)]
pub struct SkinningOutput {
    /// 变换后的顶点位置
    pub positions: Vec<Vec3>,
    /// 变换后的顶点法线
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
}

impl SkinningOutput {
    pub fn with_vertex_count(count: usize) -> Self {
        Self {
            positions: vec![Vec3::ZERO; count],
            normals: vec![Vec3::ZERO; count],
            uvs: vec![Vec2::ZERO; count],
        }
    }

    fn resize(&mut self, count: usize) {
        self.positions.resize(count, Vec3::ZERO);
        self.normals.resize(count, Vec3::ZERO);
        self.uvs.resize(count, Vec2::ZERO);
    }
}
