//! PMX 模型加载器
//!
//! 把解析后的 PmxModel 转换为运行时模型：翻转 Z 轴、校验所有索引，
//! 作者数据中的异常（越界父骨骼、错误的 IK 目标、Morph 循环等）在这里
//! 记录警告并局部修复，模型仍可使用。

use std::path::Path;

use glam::{Quat, Vec2, Vec3, Vec4};

use crate::morph::{
    BoneMorphOffset, GroupMorphOffset, MaterialFactor, MaterialMorphOffset, MaterialMorphOp, Morph,
    MorphKind, MorphManager, UvMorphOffset, VertexMorphOffset,
};
use crate::physics::MmdPhysics;
use crate::pmx::{PmxBone, PmxModel, PmxMorph, PmxMorphOffsets, PmxVertexWeight};
use crate::skeleton::{BoneFlags, BoneLink, BoneManager, IkConfig, IkLink, IkSolver};
use crate::skinning::VertexWeight;
use crate::{MmdError, Result};

use super::{MmdMaterial, MmdModel, RuntimeVertex, SubMesh};

/// 从 PMX 文件加载模型
pub fn load_pmx<P: AsRef<Path>>(path: P) -> Result<MmdModel> {
    let pmx = PmxModel::load(path.as_ref())?;
    let mut model = build_model(&pmx)?;

    // 将纹理相对路径与模型目录组合，统一使用正斜杠
    let model_dir = path.as_ref().parent().map(|p| p.to_path_buf()).unwrap_or_default();
    model.texture_paths = pmx
        .textures
        .iter()
        .map(|tex| normalize_path(&model_dir.join(tex.replace('\\', "/"))))
        .collect();
    Ok(model)
}

/// 从已解析的 PMX 数据构建运行时模型
pub fn build_model(pmx: &PmxModel) -> Result<MmdModel> {
    let vertex_count = pmx.vertices.len();
    let bone_count = pmx.bones.len();

    // 顶点
    let mut bad_weights = 0usize;
    let mut vertices = Vec::with_capacity(vertex_count);
    let mut weights = Vec::with_capacity(vertex_count);
    for v in &pmx.vertices {
        // MMD 使用左手坐标系，翻转 Z 轴；V 坐标翻转为左上原点
        vertices.push(RuntimeVertex {
            position: flip_z(v.position),
            normal: flip_z(v.normal),
            uv: Vec2::new(v.uv.x, 1.0 - v.uv.y),
        });
        weights.push(convert_weight(&v.weight, bone_count, &mut bad_weights));
    }
    if bad_weights > 0 {
        log::warn!("{} 个顶点权重引用了不存在的骨骼，已改为骨骼 0", bad_weights);
    }

    // 面：翻转 Z 轴后反转三角形顺序以保持正面朝向
    if pmx.indices.len() % 3 != 0 {
        return Err(MmdError::PmxParse(format!(
            "face index count {} is not a multiple of 3",
            pmx.indices.len()
        )));
    }
    if let Some(&bad) = pmx.indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(MmdError::PmxParse(format!(
            "face index {} out of range (vertex count {})",
            bad, vertex_count
        )));
    }
    let indices: Vec<u32> = pmx
        .indices
        .chunks_exact(3)
        .flat_map(|tri| [tri[2], tri[1], tri[0]])
        .collect();

    // 材质与子网格
    let mut materials = Vec::with_capacity(pmx.materials.len());
    let mut submeshes = Vec::with_capacity(pmx.materials.len());
    let mut index_offset = 0u32;
    for (i, mat) in pmx.materials.iter().enumerate() {
        let end = index_offset as u64 + mat.index_count as u64;
        if end > indices.len() as u64 {
            return Err(MmdError::PmxParse(format!(
                "material {} '{}' uses indices {}..{} beyond index count {}",
                i, mat.name, index_offset, end, indices.len()
            )));
        }
        submeshes.push(SubMesh::new(index_offset, mat.index_count, i));
        materials.push(MmdMaterial::from_pmx(mat));
        index_offset += mat.index_count;
    }

    let bone_manager = build_bones(&pmx.bones);
    let morph_manager = build_morphs(&pmx.morphs, vertex_count, bone_count, materials.len());

    let mut model = MmdModel::new();
    model.name = pmx.info.name.clone();
    model.vertices = vertices;
    model.indices = indices;
    model.weights = weights;
    model.materials = materials;
    model.submeshes = submeshes;
    model.texture_paths = pmx.textures.clone();
    model.rigid_bodies = pmx.rigid_bodies.clone();
    model.joints = pmx.joints.clone();
    model.bone_manager = bone_manager;
    model.morph_manager = morph_manager;

    // 物理构建失败时整个模型加载失败
    if !pmx.rigid_bodies.is_empty() {
        let mut physics = MmdPhysics::new();
        physics.build_physics(&pmx.rigid_bodies, &pmx.joints, &model.bone_manager)?;
        model.physics = Some(physics);
    }

    model.initialize_animation();

    log::info!(
        "模型构建完成: '{}', {} 顶点, {} 骨骼 ({} IK), {} Morph, {} 材质",
        model.name,
        model.vertex_count(),
        model.bone_manager.len(),
        model.bone_manager.ik_solvers().len(),
        model.morph_manager.morph_count(),
        model.material_count()
    );
    Ok(model)
}

// ============================================================================
// 骨骼
// ============================================================================

fn build_bones(pmx_bones: &[PmxBone]) -> BoneManager {
    let count = pmx_bones.len();
    let mut bones = BoneManager::new();
    for pmx_bone in pmx_bones {
        bones.add_bone(BoneLink::from_pmx_bone(pmx_bone));
    }

    // 父子关系
    for (i, pmx_bone) in pmx_bones.iter().enumerate() {
        let Some(parent) = pmx_bone.parent else {
            continue;
        };
        if parent >= count || parent == i {
            log::warn!("骨骼 {} '{}' 的父骨骼 {} 无效，作为根骨骼处理", i, pmx_bone.name, parent);
            continue;
        }
        if parent > i {
            log::warn!("骨骼 {} '{}' 的父骨骼 {} 位于其后", i, pmx_bone.name, parent);
        }
        if is_ancestor(&bones, i, parent) {
            log::warn!("骨骼 {} '{}' 与父骨骼 {} 形成循环，作为根骨骼处理", i, pmx_bone.name, parent);
            continue;
        }
        bones.add_child(parent, i);
    }

    // 附加父骨骼
    for (i, pmx_bone) in pmx_bones.iter().enumerate() {
        let Some((append, _)) = pmx_bone.append else {
            continue;
        };
        let flags = bones.bones()[i].flags;
        if !flags.intersects(BoneFlags::APPEND_ROTATE | BoneFlags::APPEND_TRANSLATE) {
            continue;
        }
        match append {
            Some(a) if a < count && a != i => {
                if a > i && pmx_bones[a].deform_depth <= pmx_bone.deform_depth {
                    log::warn!(
                        "骨骼 {} '{}' 的附加父骨骼 {} 在变换顺序中位于其后",
                        i, pmx_bone.name, a
                    );
                }
                if let Some(bone) = bones.get_bone_mut(i) {
                    bone.append_parent = Some(a);
                }
            }
            other => {
                log::warn!("骨骼 {} '{}' 的附加父骨骼 {:?} 无效，已忽略", i, pmx_bone.name, other);
                if let Some(bone) = bones.get_bone_mut(i) {
                    bone.flags.remove(BoneFlags::APPEND_ROTATE | BoneFlags::APPEND_TRANSLATE);
                }
            }
        }
    }

    // IK
    for (i, pmx_bone) in pmx_bones.iter().enumerate() {
        let Some(ik) = &pmx_bone.ik else {
            continue;
        };
        let target = match ik.target {
            Some(t) if t < count && t != i => t,
            other => {
                log::warn!("IK 骨骼 {} '{}' 的目标 {:?} 无效，跳过该 IK", i, pmx_bone.name, other);
                continue;
            }
        };

        let mut links = Vec::with_capacity(ik.links.len());
        for link in &ik.links {
            let Some(bone_index) = link.bone.filter(|&b| b < count) else {
                log::warn!("IK 骨骼 '{}' 的链接 {:?} 无效，已忽略", pmx_bone.name, link.bone);
                continue;
            };
            let (has_limits, limit_min, limit_max) = match link.limits {
                // Z 轴镜像后 X / Y 旋转方向相反
                Some((lower, upper)) => (
                    true,
                    Vec3::new(-upper.x, -upper.y, lower.z),
                    Vec3::new(-lower.x, -lower.y, upper.z),
                ),
                None => (false, Vec3::ZERO, Vec3::ZERO),
            };
            links.push(IkLink { bone_index, has_limits, limit_min, limit_max });
        }

        let config = IkConfig {
            target_bone: target,
            iterations: ik.loop_count.max(0) as u32,
            limit_angle: ik.limit_angle,
            links,
        };
        bones.add_ik_solver(IkSolver::new(pmx_bone.name.clone(), i, config));
    }

    bones.build_sort_order();
    bones.build_bind_pose();
    bones
}

/// `ancestor` 是否为 `bone` 的祖先（或自身）
fn is_ancestor(bones: &BoneManager, ancestor: usize, bone: usize) -> bool {
    let mut current = Some(bone);
    let mut guard = 0;
    while let Some(i) = current {
        if i == ancestor {
            return true;
        }
        guard += 1;
        if guard > bones.len() {
            return true;
        }
        current = bones.get_bone(i).and_then(|b| b.parent_id());
    }
    false
}

// ============================================================================
// 顶点权重
// ============================================================================

fn convert_weight(weight: &PmxVertexWeight, bone_count: usize, bad: &mut usize) -> VertexWeight {
    let mut fix = |bone: Option<usize>, w: f32| -> usize {
        match bone {
            Some(b) if b < bone_count => b,
            // 未使用的槽位（权重为 0）不计为异常
            _ => {
                if w != 0.0 {
                    *bad += 1;
                }
                0
            }
        }
    };

    match weight {
        PmxVertexWeight::Bdef1 { bone } => VertexWeight::Bdef1 { bone: fix(*bone, 1.0) },
        PmxVertexWeight::Bdef2 { bones, weight } => VertexWeight::Bdef2 {
            bones: [fix(bones[0], *weight), fix(bones[1], 1.0 - *weight)],
            weight: *weight,
        },
        PmxVertexWeight::Bdef4 { bones, weights } => VertexWeight::Bdef4 {
            bones: [
                fix(bones[0], weights[0]),
                fix(bones[1], weights[1]),
                fix(bones[2], weights[2]),
                fix(bones[3], weights[3]),
            ],
            weights: *weights,
        },
        PmxVertexWeight::Sdef { bones, weight, c, r0, r1 } => VertexWeight::sdef(
            [fix(bones[0], *weight), fix(bones[1], 1.0 - *weight)],
            *weight,
            flip_z(*c),
            flip_z(*r0),
            flip_z(*r1),
        ),
        PmxVertexWeight::Qdef { bones, weights } => VertexWeight::Qdef {
            bones: [
                fix(bones[0], weights[0]),
                fix(bones[1], weights[1]),
                fix(bones[2], weights[2]),
                fix(bones[3], weights[3]),
            ],
            weights: *weights,
        },
    }
}

// ============================================================================
// Morph
// ============================================================================

fn build_morphs(
    pmx_morphs: &[PmxMorph],
    vertex_count: usize,
    bone_count: usize,
    material_count: usize,
) -> MorphManager {
    let mut manager = MorphManager::new();
    for pmx_morph in pmx_morphs {
        manager.add_morph(convert_morph(pmx_morph, vertex_count, bone_count, material_count));
    }

    let severed = manager.sever_group_cycles();
    if severed > 0 {
        log::warn!("共切断 {} 个 Group Morph 引用", severed);
    }
    manager.init_buffers(vertex_count, material_count);
    manager
}

fn convert_morph(pmx: &PmxMorph, vertex_count: usize, bone_count: usize, material_count: usize) -> Morph {
    let mut dropped = 0usize;
    let kind = match &pmx.offsets {
        PmxMorphOffsets::Vertex(offsets) => MorphKind::Position(
            offsets
                .iter()
                .filter(|o| keep(o.vertex < vertex_count, &mut dropped))
                .map(|o| VertexMorphOffset { vertex_index: o.vertex, offset: flip_z(o.offset) })
                .collect(),
        ),
        PmxMorphOffsets::Uv(offsets) => MorphKind::Uv(
            offsets
                .iter()
                .filter(|o| keep(o.vertex < vertex_count, &mut dropped))
                .map(|o| UvMorphOffset { vertex_index: o.vertex, offset: o.offset })
                .collect(),
        ),
        PmxMorphOffsets::Bone(offsets) => MorphKind::Bone(
            offsets
                .iter()
                .filter_map(|o| match o.bone {
                    Some(b) if b < bone_count => Some(BoneMorphOffset {
                        bone_index: b,
                        translation: flip_z(o.translation),
                        rotation: flip_rotation(o.rotation),
                    }),
                    _ => {
                        dropped += 1;
                        None
                    }
                })
                .collect(),
        ),
        PmxMorphOffsets::Material(offsets) => MorphKind::Material(
            offsets
                .iter()
                .filter_map(|o| {
                    let operation = match o.operation {
                        0 => MaterialMorphOp::Multiply,
                        1 => MaterialMorphOp::Add,
                        _ => {
                            dropped += 1;
                            return None;
                        }
                    };
                    if o.material.is_some_and(|m| m >= material_count) {
                        dropped += 1;
                        return None;
                    }
                    Some(MaterialMorphOffset {
                        material_index: o.material,
                        operation,
                        factor: MaterialFactor {
                            diffuse: o.diffuse,
                            specular: o.specular,
                            specular_power: o.specular_power,
                            ambient: o.ambient,
                            edge_color: o.edge_color,
                            edge_size: o.edge_size,
                            texture_factor: o.texture_factor,
                            sphere_texture_factor: o.sphere_texture_factor,
                            toon_texture_factor: o.toon_texture_factor,
                        },
                    })
                })
                .collect(),
        ),
        // 越界引用由循环检测统一处理
        PmxMorphOffsets::Group(offsets) => MorphKind::Group(
            offsets
                .iter()
                .map(|o| GroupMorphOffset { morph_index: o.morph, influence: o.weight })
                .collect(),
        ),
        PmxMorphOffsets::AdditionalUv(..) | PmxMorphOffsets::Flip(_) | PmxMorphOffsets::Impulse(_) => {
            MorphKind::Unsupported
        }
    };

    if dropped > 0 {
        log::warn!("Morph '{}' 有 {} 个偏移引用无效，已忽略", pmx.name, dropped);
    }
    Morph::new(pmx.name.clone(), kind)
}

fn keep(valid: bool, dropped: &mut usize) -> bool {
    if !valid {
        *dropped += 1;
    }
    valid
}

// ============================================================================
// 辅助
// ============================================================================

#[inline]
fn flip_z(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.y, -v.z)
}

/// 左手 → 右手，零长度四元数视为单位旋转
fn flip_rotation(q: Vec4) -> Quat {
    let flipped = Quat::from_xyzw(q.x, q.y, -q.z, -q.w);
    if flipped.length_squared() <= f32::EPSILON {
        Quat::IDENTITY
    } else {
        flipped.normalize()
    }
}

/// 规范化路径（统一使用正斜杠）
fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
