//! MMD 运行时模型
//!
//! 每帧流程（严格按顺序，不可重入）：
//! begin → VMD 评估 → Morph → 骨骼(物理前) → 物理 → 骨骼(物理后) → end → 蒙皮

use glam::{Mat4, Vec2, Vec3};

use crate::animation::VmdAnimation;
use crate::morph::MorphManager;
use crate::physics::MmdPhysics;
use crate::pmx::{PmxJoint, PmxRigidBody};
use crate::skeleton::BoneManager;
use crate::skinning::{compute_skinning, SkinningContext, SkinningInput, SkinningOutput};

use super::{MmdMaterial, RuntimeVertex, SubMesh, VertexWeight};

/// MMD 运行时模型
pub struct MmdModel {
    // 静态数据
    pub name: String,
    pub vertices: Vec<RuntimeVertex>,
    pub indices: Vec<u32>,
    pub weights: Vec<VertexWeight>,
    pub materials: Vec<MmdMaterial>,
    pub submeshes: Vec<SubMesh>,
    pub texture_paths: Vec<String>,
    pub rigid_bodies: Vec<PmxRigidBody>,
    pub joints: Vec<PmxJoint>,

    // 子系统
    pub bone_manager: BoneManager,
    pub morph_manager: MorphManager,

    // 运行时数据
    skinning: SkinningContext,
    skinning_matrices: Vec<Mat4>,
    output: SkinningOutput,

    // 物理系统
    pub(crate) physics: Option<MmdPhysics>,
    physics_enabled: bool,
}

impl Default for MmdModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MmdModel {
    /// 创建空模型
    pub fn new() -> Self {
        Self {
            name: String::new(),
            vertices: Vec::new(),
            indices: Vec::new(),
            weights: Vec::new(),
            materials: Vec::new(),
            submeshes: Vec::new(),
            texture_paths: Vec::new(),
            rigid_bodies: Vec::new(),
            joints: Vec::new(),
            bone_manager: BoneManager::new(),
            morph_manager: MorphManager::new(),
            skinning: SkinningContext::default(),
            skinning_matrices: Vec::new(),
            output: SkinningOutput::default(),
            physics: None,
            physics_enabled: true,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    pub fn submesh_count(&self) -> usize {
        self.submeshes.len()
    }

    pub fn bone_count(&self) -> usize {
        self.bone_manager.len()
    }

    pub fn morph_count(&self) -> usize {
        self.morph_manager.morph_count()
    }

    // ========== 动画流程 ==========

    /// 初始化动画状态
    ///
    /// 清零动画量、Morph 权重并启用所有 IK，完整执行一遍流程得到绑定姿势，
    /// 然后把刚体重置到该姿势。
    pub fn initialize_animation(&mut self) {
        self.bone_manager.reset_animation();
        self.morph_manager.reset_all_weights();
        self.bone_manager.enable_all_ik();

        self.begin_animation();
        self.update_morph_animation();
        self.update_node_animation(false);
        self.update_node_animation(true);
        self.end_animation();

        self.reset_physics();
        self.update();
    }

    /// 开始动画帧
    pub fn begin_animation(&mut self) {
        self.bone_manager.begin_update();
        self.morph_manager.begin_update();
    }

    /// 更新 Morph 动画，并把材质系数合并到材质
    pub fn update_morph_animation(&mut self) {
        self.morph_manager.apply_morphs(&mut self.bone_manager);

        let buffers = self.morph_manager.buffers();
        for (i, material) in self.materials.iter_mut().enumerate() {
            match (buffers.material_mul.get(i), buffers.material_add.get(i)) {
                (Some(mul), Some(add)) => material.apply_morph_factors(mul, add),
                _ => material.reset(),
            }
        }
    }

    /// 更新骨骼动画（物理前/后）
    pub fn update_node_animation(&mut self, after_physics: bool) {
        self.bone_manager.update_node_animation(after_physics);
    }

    /// 推进物理并把动态刚体的结果写回骨骼，返回实际执行的子步数
    pub fn update_physics_animation(&mut self, delta_time: f32) -> u32 {
        if !self.physics_enabled {
            return 0;
        }
        match self.physics.as_mut() {
            Some(physics) => physics.update_animation(&mut self.bone_manager, delta_time),
            None => 0,
        }
    }

    /// 结束动画帧：生成蒙皮矩阵
    pub fn end_animation(&mut self) {
        self.bone_manager.write_skinning_matrices(&mut self.skinning_matrices);
    }

    /// 更新顶点（蒙皮计算），rayon 并行
    pub fn update(&mut self) {
        let buffers = self.morph_manager.buffers();
        let input = SkinningInput {
            vertices: &self.vertices,
            weights: &self.weights,
            bone_matrices: &self.skinning_matrices,
            position_offsets: &buffers.positions,
            uv_offsets: &buffers.uvs,
        };
        compute_skinning(&self.skinning, &input, &mut self.output);
    }

    /// 完整动画更新流程
    pub fn update_all_animation(&mut self, vmd: Option<&VmdAnimation>, frame: f32, delta_time: f32) {
        self.begin_animation();

        if let Some(animation) = vmd {
            animation.evaluate(frame, &mut self.bone_manager, &mut self.morph_manager);
        }

        self.update_morph_animation();
        self.update_node_animation(false);
        self.update_physics_animation(delta_time);
        self.update_node_animation(true);

        self.end_animation();
        self.update();
    }

    // ========== 基础动画 ==========

    /// 保存当前姿势为基础动画（交叉淡入的起点）
    pub fn save_base_animation(&mut self) {
        self.bone_manager.save_base_animation();
        self.morph_manager.save_base_animation();
    }

    pub fn load_base_animation(&mut self) {
        self.bone_manager.load_base_animation();
        self.morph_manager.load_base_animation();
    }

    pub fn clear_base_animation(&mut self) {
        self.bone_manager.clear_base_animation();
        self.morph_manager.clear_base_animation();
    }

    // ========== 物理 ==========

    /// 把刚体重置到当前骨骼姿势
    pub fn reset_physics(&mut self) {
        if let Some(physics) = self.physics.as_mut() {
            physics.reset(&mut self.bone_manager);
        }
    }

    /// 启用 / 禁用物理，重新启用时从当前姿势重置刚体
    pub fn set_physics_enabled(&mut self, enabled: bool) {
        let was_enabled = self.physics_enabled;
        self.physics_enabled = enabled;
        if enabled && !was_enabled {
            self.reset_physics();
        }
    }

    pub fn is_physics_enabled(&self) -> bool {
        self.physics_enabled
    }

    pub fn has_physics(&self) -> bool {
        self.physics.is_some()
    }

    pub fn physics(&self) -> Option<&MmdPhysics> {
        self.physics.as_ref()
    }

    pub fn physics_mut(&mut self) -> Option<&mut MmdPhysics> {
        self.physics.as_mut()
    }

    // ========== 渲染层查询 ==========

    /// 蒙皮矩阵（逆绑定矩阵 × 当前全局变换）
    pub fn skinning_matrices(&self) -> &[Mat4] {
        &self.skinning_matrices
    }

    pub fn update_positions(&self) -> &[Vec3] {
        &self.output.positions
    }

    pub fn update_normals(&self) -> &[Vec3] {
        &self.output.normals
    }

    pub fn update_uvs(&self) -> &[Vec2] {
        &self.output.uvs
    }

    pub fn materials(&self) -> &[MmdMaterial] {
        &self.materials
    }

    pub fn submeshes(&self) -> &[SubMesh] {
        &self.submeshes
    }

    pub fn get_material_name(&self, index: usize) -> Option<&str> {
        self.materials.get(index).map(|m| m.name.as_str())
    }

    pub fn find_bone(&self, name: &str) -> Option<usize> {
        self.bone_manager.find_bone_by_name(name)
    }

    pub fn find_morph(&self, name: &str) -> Option<usize> {
        self.morph_manager.find_morph_by_name(name)
    }

    /// 骨骼全局变换
    pub fn bone_global_transform(&self, index: usize) -> Option<Mat4> {
        self.bone_manager.get_bone(index).map(|b| b.global_transform())
    }

    /// 按名称设置 Morph 权重，名称不存在时返回 false
    pub fn set_morph_weight_by_name(&mut self, name: &str, weight: f32) -> bool {
        match self.morph_manager.find_morph_by_name(name) {
            Some(index) => {
                self.morph_manager.set_morph_weight(index, weight);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::vmd_loader::tests::VmdBytes;
    use crate::model::build_model;
    use crate::model::loader::tests::{pmx_bone, pmx_model};
    use crate::physics::rigid_body::tests::pmx_body;
    use crate::test_util::init_logger;
    use crate::pmx::{MorphPanel, PmxMaterialOffset, PmxMorph, PmxMorphOffsets, PmxVertexOffset, RigidBodyMode};
    use glam::{Quat, Vec4};

    fn model_with_morphs() -> MmdModel {
        let mut pmx = pmx_model();
        pmx.morphs = vec![
            PmxMorph {
                name: "上".to_string(),
                name_en: String::new(),
                panel: MorphPanel::Other,
                offsets: PmxMorphOffsets::Vertex(vec![PmxVertexOffset {
                    vertex: 0,
                    offset: Vec3::new(0.0, 1.0, 0.0),
                }]),
            },
            PmxMorph {
                name: "赤".to_string(),
                name_en: String::new(),
                panel: MorphPanel::Other,
                offsets: PmxMorphOffsets::Material(vec![PmxMaterialOffset {
                    material: None,
                    operation: 1,
                    diffuse: Vec4::new(0.2, 0.0, 0.0, 0.0),
                    specular: Vec3::ZERO,
                    specular_power: 0.0,
                    ambient: Vec3::ZERO,
                    edge_color: Vec4::ZERO,
                    edge_size: 0.0,
                    texture_factor: Vec4::ZERO,
                    sphere_texture_factor: Vec4::ZERO,
                    toon_texture_factor: Vec4::ZERO,
                }]),
            },
        ];
        build_model(&pmx).unwrap()
    }

    #[test]
    fn test_initial_pose_matches_rest_mesh() {
        let mut model = build_model(&pmx_model()).unwrap();
        assert_eq!(model.skinning_matrices().len(), 2);
        for m in model.skinning_matrices() {
            assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-5));
        }
        model.update_all_animation(None, 0.0, 1.0 / 60.0);
        for (out, v) in model.update_positions().iter().zip(&model.vertices) {
            assert!(out.abs_diff_eq(v.position, 1e-5));
        }
        assert_eq!(model.update_uvs()[0], Vec2::new(0.25, 0.75));
    }

    #[test]
    fn test_position_morph_half_weight() {
        let mut model = model_with_morphs();
        assert!(model.set_morph_weight_by_name("上", 0.5));
        assert!(!model.set_morph_weight_by_name("missing", 1.0));

        model.begin_animation();
        model.update_morph_animation();
        let offsets = model.morph_manager.position_offsets();
        assert_eq!(offsets[0], Vec3::new(0.0, 0.5, 0.0));
        assert!(offsets[1..].iter().all(|o| *o == Vec3::ZERO));

        model.update_node_animation(false);
        model.update_node_animation(true);
        model.end_animation();
        model.update();
        assert!(model.update_positions()[0].abs_diff_eq(Vec3::new(0.0, 0.5, 0.0), 1e-5));
    }

    #[test]
    fn test_material_morph_applied_and_cleared() {
        let mut model = model_with_morphs();
        let index = model.find_morph("赤").unwrap();
        model.morph_manager.set_morph_weight(index, 1.0);
        model.update_all_animation(None, 0.0, 0.0);
        let diffuse = model.materials()[0].current.diffuse;
        assert!(diffuse.abs_diff_eq(Vec4::new(1.0, 0.6, 0.4, 1.0), 1e-6));

        model.morph_manager.set_morph_weight(index, 0.0);
        model.update_all_animation(None, 0.0, 0.0);
        assert_eq!(model.materials()[0].current, model.materials()[0].initial);
    }

    #[test]
    fn test_vmd_drives_bone_and_skinning() {
        init_logger();
        let bytes = VmdBytes::header()
            .u32(1)
            .bone_key("センター", 0, [1.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0])
            .u32(0);
        let vmd = VmdAnimation::load_from_bytes(&bytes.0).unwrap();

        let mut model = build_model(&pmx_model()).unwrap();
        model.update_all_animation(Some(&vmd), 0.0, 0.0);

        let center = model.find_bone("センター").unwrap();
        let global = model.bone_global_transform(center).unwrap();
        assert!(global.w_axis.truncate().abs_diff_eq(Vec3::X, 1e-6));
        // 顶点 0 绑定到センター
        assert!(model.update_positions()[0].abs_diff_eq(Vec3::X, 1e-5));
        // 子骨骼跟随
        let upper = model.bone_global_transform(1).unwrap();
        assert!(upper.w_axis.truncate().abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1e-6));
    }

    #[test]
    fn test_base_animation_roundtrip() {
        let mut model = build_model(&pmx_model()).unwrap();
        let rotation = Quat::from_rotation_y(0.5);
        if let Some(bone) = model.bone_manager.get_bone_mut(1) {
            bone.animation_rotate = rotation;
        }
        model.save_base_animation();
        if let Some(bone) = model.bone_manager.get_bone_mut(1) {
            bone.animation_rotate = Quat::IDENTITY;
        }
        model.load_base_animation();
        assert_eq!(model.bone_manager.get_bone(1).unwrap().animation_rotate, rotation);
    }

    #[test]
    fn test_physics_toggle() {
        init_logger();
        let mut pmx = pmx_model();
        pmx.bones.push(pmx_bone("髪", [0.0, 2.0, 0.0], Some(1)));
        pmx.rigid_bodies.push(pmx_body("head", RigidBodyMode::Static, Some(1), 1.0));
        pmx.rigid_bodies.push(pmx_body("hair", RigidBodyMode::Dynamic, Some(2), 2.0));
        let mut model = build_model(&pmx).unwrap();
        assert!(model.has_physics());
        assert_eq!(model.physics().map(|p| p.rigid_body_count()), Some(2));

        model.set_physics_enabled(false);
        assert_eq!(model.update_physics_animation(1.0), 0);
        model.set_physics_enabled(true);
        assert!(model.update_physics_animation(1.0) > 0);

        let plain = build_model(&pmx_model()).unwrap();
        assert!(!plain.has_physics());
    }
}
