//! 顶点蒙皮计算
//!
//! 顶点缓冲区按连续区间切分后用 rayon 并行计算，
//! 每个顶点只读取自身数据与共享的骨骼矩阵。

use glam::{Mat4, Quat, Vec2, Vec3};
use rayon::prelude::*;

use super::{SkinningInput, SkinningOutput, VertexWeight};

/// 蒙皮上下文
#[derive(Clone, Debug)]
pub struct SkinningContext {
    /// 每个区间的目标顶点数
    pub range_size: usize,
    /// 区间数上限
    pub max_ranges: usize,
}

impl Default for SkinningContext {
    fn default() -> Self {
        Self {
            range_size: 1000,
            max_ranges: rayon::current_num_threads().max(16),
        }
    }
}

impl SkinningContext {
    /// 每个区间实际的顶点数
    pub fn chunk_size(&self, vertex_count: usize) -> usize {
        let range_size = self.range_size.max(1);
        let ranges = vertex_count.div_ceil(range_size).clamp(1, self.max_ranges.max(1));
        vertex_count.div_ceil(ranges).max(1)
    }
}

/// 计算蒙皮，结果写入 `output`（长度不足时自动扩展）
pub fn compute_skinning(ctx: &SkinningContext, input: &SkinningInput, output: &mut SkinningOutput) {
    let vertex_count = input.vertices.len();
    output.resize(vertex_count);
    if vertex_count == 0 {
        return;
    }

    let chunk = ctx.chunk_size(vertex_count);
    output
        .positions
        .par_chunks_mut(chunk)
        .zip(output.normals.par_chunks_mut(chunk))
        .zip(output.uvs.par_chunks_mut(chunk))
        .enumerate()
        .for_each(|(range, ((positions, normals), uvs))| {
            let begin = range * chunk;
            for (offset, ((pos_out, norm_out), uv_out)) in positions
                .iter_mut()
                .zip(normals.iter_mut())
                .zip(uvs.iter_mut())
                .enumerate()
            {
                let i = begin + offset;
                let vertex = &input.vertices[i];
                let position = vertex.position
                    + input.position_offsets.get(i).copied().unwrap_or(Vec3::ZERO);
                let weight = input.weights.get(i).cloned().unwrap_or_default();

                let (pos, norm) = skin_vertex(position, vertex.normal, &weight, input.bone_matrices);
                *pos_out = pos;
                *norm_out = norm;

                let uv = vertex.uv;
                *uv_out = match input.uv_offsets.get(i) {
                    // V 轴在加载时已翻转
                    Some(off) => uv + Vec2::new(off.x, -off.y),
                    None => uv,
                };
            }
        });
}

/// 计算单个顶点的蒙皮
pub fn skin_vertex(position: Vec3, normal: Vec3, weight: &VertexWeight, matrices: &[Mat4]) -> (Vec3, Vec3) {
    match weight {
        VertexWeight::Bdef1 { bone } => {
            let m = get_matrix(matrices, *bone);
            (m.transform_point3(position), m.transform_vector3(normal).normalize_or_zero())
        }
        VertexWeight::Bdef2 { bones, weight } => {
            let m = blend_matrices(matrices, bones, &[*weight, 1.0 - *weight]);
            (m.transform_point3(position), m.transform_vector3(normal).normalize_or_zero())
        }
        VertexWeight::Bdef4 { bones, weights } => {
            let m = blend_matrices(matrices, bones, weights);
            (m.transform_point3(position), m.transform_vector3(normal).normalize_or_zero())
        }
        VertexWeight::Sdef { bones, weight, c, cr0, cr1 } => {
            let m0 = get_matrix(matrices, bones[0]);
            let m1 = get_matrix(matrices, bones[1]);
            let w0 = *weight;
            let w1 = 1.0 - w0;

            let q0 = rotation_of(&m0);
            let q1 = rotation_of(&m1);
            let rotation = q0.slerp(q1, w1);

            let pos = rotation * (position - *c)
                + m0.transform_point3(*cr0) * w0
                + m1.transform_point3(*cr1) * w1;
            (pos, (rotation * normal).normalize_or_zero())
        }
        VertexWeight::Qdef { bones, weights } => skin_dual_quat(position, normal, bones, weights, matrices),
    }
}

/// 双四元数线性混合
fn skin_dual_quat(
    position: Vec3,
    normal: Vec3,
    bones: &[usize; 4],
    weights: &[f32; 4],
    matrices: &[Mat4],
) -> (Vec3, Vec3) {
    let mut real_sum = glam::Vec4::ZERO;
    let mut dual_sum = glam::Vec4::ZERO;
    let mut pivot: Option<Quat> = None;

    for (&bone, &w) in bones.iter().zip(weights.iter()) {
        if w == 0.0 {
            continue;
        }
        let m = get_matrix(matrices, bone);
        let real = rotation_of(&m);
        let t = m.w_axis.truncate();
        // dual = 0.5 * t * real
        let dual = Quat::from_xyzw(t.x, t.y, t.z, 0.0) * real * 0.5;

        // 与第一个四元数保持同一半球
        let sign = match pivot {
            Some(p) if p.dot(real) < 0.0 => -1.0,
            Some(_) => 1.0,
            None => {
                pivot = Some(real);
                1.0
            }
        };
        real_sum += glam::Vec4::from(real) * (w * sign);
        dual_sum += glam::Vec4::from(dual) * (w * sign);
    }

    let len = real_sum.length();
    if len <= f32::EPSILON {
        return (position, normal);
    }
    let real = Quat::from_vec4(real_sum / len);
    let dual = Quat::from_vec4(dual_sum / len);
    let translation = (dual * real.conjugate() * 2.0).xyz();

    (real * position + translation, (real * normal).normalize_or_zero())
}

fn blend_matrices(matrices: &[Mat4], bones: &[usize], weights: &[f32]) -> Mat4 {
    let mut m = Mat4::ZERO;
    for (&bone, &w) in bones.iter().zip(weights.iter()) {
        if w != 0.0 {
            m += get_matrix(matrices, bone) * w;
        }
    }
    m
}

/// 去掉缩放后的旋转
fn rotation_of(m: &Mat4) -> Quat {
    let (_, rotation, _) = m.to_scale_rotation_translation();
    rotation.normalize()
}

#[inline]
fn get_matrix(matrices: &[Mat4], index: usize) -> Mat4 {
    matrices.get(index).copied().unwrap_or(Mat4::IDENTITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skinning::RuntimeVertex;
    use glam::Vec4;

    fn input<'a>(
        vertices: &'a [RuntimeVertex],
        weights: &'a [VertexWeight],
        matrices: &'a [Mat4],
    ) -> SkinningInput<'a> {
        SkinningInput {
            vertices,
            weights,
            bone_matrices: matrices,
            position_offsets: &[],
            uv_offsets: &[],
        }
    }

    #[test]
    fn test_bdef1_follows_bone() {
        let m = [Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0))];
        let (pos, norm) = skin_vertex(Vec3::X, Vec3::Y, &VertexWeight::Bdef1 { bone: 0 }, &m);
        assert_eq!(pos, Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(norm, Vec3::Y);
    }

    #[test]
    fn test_bdef2_blends_linearly() {
        let m = [Mat4::IDENTITY, Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0))];
        let weight = VertexWeight::Bdef2 { bones: [0, 1], weight: 0.25 };
        let (pos, _) = skin_vertex(Vec3::ZERO, Vec3::Y, &weight, &m);
        assert!(pos.abs_diff_eq(Vec3::new(0.0, 1.5, 0.0), 1e-6));
    }

    #[test]
    fn test_sdef_matches_bdef2_for_pure_translation() {
        let m = [
            Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)),
            Mat4::from_translation(Vec3::new(0.0, 3.0, 0.0)),
        ];
        let sdef = VertexWeight::sdef([0, 1], 0.5, Vec3::new(0.0, 1.0, 0.0), Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0));
        let bdef = VertexWeight::Bdef2 { bones: [0, 1], weight: 0.5 };
        let p = Vec3::new(0.3, 1.2, -0.1);
        let (a, _) = skin_vertex(p, Vec3::Y, &sdef, &m);
        let (b, _) = skin_vertex(p, Vec3::Y, &bdef, &m);
        assert!(a.abs_diff_eq(b, 1e-5));
    }

    #[test]
    fn test_sdef_keeps_volume_at_bend() {
        let rot = Mat4::from_quat(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let m = [Mat4::IDENTITY, rot];
        let sdef = VertexWeight::sdef([0, 1], 0.5, Vec3::ZERO, Vec3::ZERO, Vec3::ZERO);
        let p = Vec3::new(1.0, 0.0, 0.0);
        let (pos, _) = skin_vertex(p, Vec3::Y, &sdef, &m);
        // 线性混合会收缩到 ~0.707，球面混合保持半径
        assert!((pos.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_qdef_rigid_transform() {
        let m = [Mat4::from_rotation_translation(Quat::from_rotation_y(0.7), Vec3::new(1.0, 2.0, 3.0))];
        let weight = VertexWeight::Qdef { bones: [0, 0, 0, 0], weights: [1.0, 0.0, 0.0, 0.0] };
        let p = Vec3::new(0.5, -1.0, 2.0);
        let (pos, _) = skin_vertex(p, Vec3::Y, &weight, &m);
        assert!(pos.abs_diff_eq(m[0].transform_point3(p), 1e-5));
    }

    #[test]
    fn test_chunk_size() {
        let ctx = SkinningContext { range_size: 1000, max_ranges: 16 };
        assert_eq!(ctx.chunk_size(10), 10);
        assert_eq!(ctx.chunk_size(2500), 834);
        // 区间数受上限约束
        assert_eq!(ctx.chunk_size(160_000), 10_000);
    }

    #[test]
    fn test_parallel_matches_serial_with_offsets() {
        let count = 2345;
        let vertices: Vec<RuntimeVertex> = (0..count)
            .map(|i| RuntimeVertex {
                position: Vec3::new(i as f32, 0.0, 0.0),
                normal: Vec3::Y,
                uv: Vec2::new(0.5, 0.5),
            })
            .collect();
        let weights: Vec<VertexWeight> = (0..count).map(|i| VertexWeight::Bdef1 { bone: i % 2 }).collect();
        let matrices = [Mat4::IDENTITY, Mat4::from_translation(Vec3::Z)];
        let mut offsets = vec![Vec3::ZERO; count];
        offsets[7] = Vec3::new(0.0, 1.0, 0.0);
        let mut uv_offsets = vec![Vec4::ZERO; count];
        uv_offsets[3] = Vec4::new(0.1, 0.2, 0.0, 0.0);

        let mut skin_input = input(&vertices, &weights, &matrices);
        skin_input.position_offsets = &offsets;
        skin_input.uv_offsets = &uv_offsets;

        let mut output = SkinningOutput::default();
        compute_skinning(&SkinningContext::default(), &skin_input, &mut output);

        assert_eq!(output.positions.len(), count);
        for i in 0..count {
            let (expected, _) = skin_vertex(vertices[i].position + offsets[i], Vec3::Y, &weights[i], &matrices);
            assert_eq!(output.positions[i], expected);
        }
        assert_eq!(output.positions[7], Vec3::new(7.0, 1.0, 1.0));
        assert!(output.uvs[3].abs_diff_eq(Vec2::new(0.6, 0.3), 1e-6));
        assert_eq!(output.uvs[4], Vec2::new(0.5, 0.5));
    }
}
