//! Morph 管理器

use std::collections::HashMap;
use glam::{Vec3, Vec4};

use crate::skeleton::BoneManager;
use super::{
    BoneMorphOffset, MaterialFactor, MaterialMorphOffset, MaterialMorphOp, Morph, MorphKind,
    UvMorphOffset, VertexMorphOffset,
};

/// Group Morph 运行时递归深度上限
const MAX_GROUP_DEPTH: u32 = 32;

/// Morph 累加缓冲区（每帧开始时清零）
#[derive(Clone, Debug, Default)]
pub struct MorphBuffers {
    /// 顶点位置偏移（每顶点一个）
    pub positions: Vec<Vec3>,
    /// UV 偏移（每顶点一个，只使用 xy）
    pub uvs: Vec<Vec4>,
    /// 材质乘算系数（每材质一个）
    pub material_mul: Vec<MaterialFactor>,
    /// 材质加算系数（每材质一个）
    pub material_add: Vec<MaterialFactor>,
}

impl MorphBuffers {
    pub fn new(vertex_count: usize, material_count: usize) -> Self {
        Self {
            positions: vec![Vec3::ZERO; vertex_count],
            uvs: vec![Vec4::ZERO; vertex_count],
            material_mul: vec![MaterialFactor::ONE; material_count],
            material_add: vec![MaterialFactor::ZERO; material_count],
        }
    }

    /// 清零
    pub fn reset(&mut self) {
        self.positions.fill(Vec3::ZERO);
        self.uvs.fill(Vec4::ZERO);
        self.material_mul.fill(MaterialFactor::ONE);
        self.material_add.fill(MaterialFactor::ZERO);
    }
}

/// DFS 访问状态
#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    White,
    Gray,
    Black,
}

/// Morph 管理器
#[derive(Clone, Debug, Default)]
pub struct MorphManager {
    morphs: Vec<Morph>,
    name_to_index: HashMap<String, usize>,
    buffers: MorphBuffers,
}

impl MorphManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加 Morph
    pub fn add_morph(&mut self, morph: Morph) -> usize {
        let index = self.morphs.len();
        self.name_to_index.entry(morph.name.clone()).or_insert(index);
        self.morphs.push(morph);
        index
    }

    /// 通过名称查找 Morph
    pub fn find_morph_by_name(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// 获取 Morph 数量
    pub fn morph_count(&self) -> usize {
        self.morphs.len()
    }

    pub fn morphs(&self) -> &[Morph] {
        &self.morphs
    }

    /// 获取 Morph
    pub fn get_morph(&self, index: usize) -> Option<&Morph> {
        self.morphs.get(index)
    }

    /// 获取可变 Morph 引用
    pub fn get_morph_mut(&mut self, index: usize) -> Option<&mut Morph> {
        self.morphs.get_mut(index)
    }

    /// 设置 Morph 权重
    pub fn set_morph_weight(&mut self, index: usize, weight: f32) {
        if let Some(morph) = self.morphs.get_mut(index) {
            morph.set_weight(weight);
        }
    }

    /// 获取 Morph 权重
    pub fn get_morph_weight(&self, index: usize) -> f32 {
        self.morphs.get(index).map(|m| m.weight).unwrap_or(0.0)
    }

    /// 重置所有 Morph 权重
    pub fn reset_all_weights(&mut self) {
        for morph in &mut self.morphs {
            morph.reset();
        }
    }

    pub fn save_base_animation(&mut self) {
        for morph in &mut self.morphs {
            morph.save_base_animation();
        }
    }

    pub fn load_base_animation(&mut self) {
        for morph in &mut self.morphs {
            morph.load_base_animation();
        }
    }

    pub fn clear_base_animation(&mut self) {
        for morph in &mut self.morphs {
            morph.clear_base_animation();
        }
    }

    // ========== 缓冲区 ==========

    /// 按顶点数与材质数分配缓冲区
    pub fn init_buffers(&mut self, vertex_count: usize, material_count: usize) {
        self.buffers = MorphBuffers::new(vertex_count, material_count);
    }

    /// 清零缓冲区（每帧开始）
    pub fn begin_update(&mut self) {
        self.buffers.reset();
    }

    pub fn buffers(&self) -> &MorphBuffers {
        &self.buffers
    }

    pub fn position_offsets(&self) -> &[Vec3] {
        &self.buffers.positions
    }

    pub fn uv_offsets(&self) -> &[Vec4] {
        &self.buffers.uvs
    }

    // ========== 循环检测 ==========

    /// 切断 Group Morph 的循环引用，返回被切断的引用数
    ///
    /// 白/灰/黑三色深度优先遍历，显式栈。指向灰色节点（仍在栈上）的边
    /// 即为回边，置为 None。越界引用同样置为 None。
    pub fn sever_group_cycles(&mut self) -> usize {
        let count = self.morphs.len();
        let mut color = vec![Visit::White; count];
        let mut severed = 0;

        for start in 0..count {
            if color[start] != Visit::White {
                continue;
            }
            color[start] = Visit::Gray;
            // (节点, 下一个要检查的子项)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some(top) = stack.last_mut() {
                let (node, slot) = *top;
                let child = match &self.morphs[node].kind {
                    MorphKind::Group(offsets) if slot < offsets.len() => Some(offsets[slot].morph_index),
                    _ => None,
                };

                let Some(child) = child else {
                    color[node] = Visit::Black;
                    stack.pop();
                    continue;
                };
                top.1 += 1;

                let Some(child) = child else {
                    continue;
                };

                let sever = if child >= count {
                    log::warn!(
                        "Group Morph '{}' 引用了不存在的 Morph {}，已忽略",
                        self.morphs[node].name, child
                    );
                    true
                } else {
                    match color[child] {
                        Visit::Gray => {
                            log::warn!(
                                "Group Morph '{}' 与 '{}' 存在循环引用，已切断",
                                self.morphs[node].name, self.morphs[child].name
                            );
                            true
                        }
                        Visit::White => {
                            color[child] = Visit::Gray;
                            stack.push((child, 0));
                            false
                        }
                        Visit::Black => false,
                    }
                };

                if sever {
                    if let MorphKind::Group(offsets) = &mut self.morphs[node].kind {
                        offsets[slot].morph_index = None;
                    }
                    severed += 1;
                }
            }
        }

        severed
    }

    // ========== Morph 应用 ==========

    /// 应用所有 Morph
    ///
    /// 缓冲区需已在本帧清零；骨骼 Morph 叠加到骨骼当前 TRS 上。
    pub fn apply_morphs(&mut self, bone_manager: &mut BoneManager) {
        for index in 0..self.morphs.len() {
            let weight = self.morphs[index].weight;
            if weight == 0.0 {
                continue;
            }
            Self::apply_single_morph(&self.morphs, index, weight, &mut self.buffers, bone_manager, 0);
        }
    }

    /// 应用单个 Morph（depth 为运行时递归保护）
    fn apply_single_morph(
        morphs: &[Morph],
        morph_idx: usize,
        weight: f32,
        buffers: &mut MorphBuffers,
        bone_manager: &mut BoneManager,
        depth: u32,
    ) {
        if depth > MAX_GROUP_DEPTH || weight == 0.0 {
            return;
        }
        let Some(morph) = morphs.get(morph_idx) else {
            return;
        };

        match &morph.kind {
            MorphKind::Position(offsets) => {
                Self::apply_vertex_morph(offsets, weight, &mut buffers.positions);
            }
            MorphKind::Uv(offsets) => {
                Self::apply_uv_morph(offsets, weight, &mut buffers.uvs);
            }
            MorphKind::Material(offsets) => {
                Self::apply_material_morph(offsets, weight, buffers);
            }
            MorphKind::Bone(offsets) => {
                Self::apply_bone_morph(offsets, weight, bone_manager);
            }
            MorphKind::Group(offsets) => {
                for sub in offsets {
                    if let Some(sub_idx) = sub.morph_index {
                        Self::apply_single_morph(
                            morphs, sub_idx, weight * sub.influence, buffers, bone_manager, depth + 1,
                        );
                    }
                }
            }
            MorphKind::Unsupported => {}
        }
    }

    fn apply_vertex_morph(offsets: &[VertexMorphOffset], weight: f32, positions: &mut [Vec3]) {
        for offset in offsets {
            if let Some(p) = positions.get_mut(offset.vertex_index) {
                *p += offset.offset * weight;
            }
        }
    }

    fn apply_uv_morph(offsets: &[UvMorphOffset], weight: f32, uvs: &mut [Vec4]) {
        for offset in offsets {
            if let Some(uv) = uvs.get_mut(offset.vertex_index) {
                *uv += offset.offset * weight;
            }
        }
    }

    /// 骨骼 Morph：平移叠加，旋转向偏移值球面插值
    fn apply_bone_morph(offsets: &[BoneMorphOffset], weight: f32, bone_manager: &mut BoneManager) {
        for offset in offsets {
            if let Some(bone) = bone_manager.get_bone_mut(offset.bone_index) {
                bone.translate += offset.translation * weight;
                bone.rotate = bone.rotate.slerp(offset.rotation, weight);
            }
        }
    }

    /// 材质 Morph；material_index 为 None 时作用于全部材质
    fn apply_material_morph(offsets: &[MaterialMorphOffset], weight: f32, buffers: &mut MorphBuffers) {
        for offset in offsets {
            let targets = match offset.operation {
                MaterialMorphOp::Multiply => &mut buffers.material_mul,
                MaterialMorphOp::Add => &mut buffers.material_add,
            };
            let apply = |f: &mut MaterialFactor| match offset.operation {
                MaterialMorphOp::Multiply => f.apply_multiply(&offset.factor, weight),
                MaterialMorphOp::Add => f.apply_additive(&offset.factor, weight),
            };
            match offset.material_index {
                None => targets.iter_mut().for_each(apply),
                Some(i) => {
                    if let Some(f) = targets.get_mut(i) {
                        apply(f);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morph::GroupMorphOffset;
    use crate::skeleton::{BoneLink, BoneSet};
    use glam::Quat;

    fn position_morph(name: &str, vertex: usize, offset: Vec3) -> Morph {
        Morph::new(
            name.to_string(),
            MorphKind::Position(vec![VertexMorphOffset { vertex_index: vertex, offset }]),
        )
    }

    fn group(name: &str, children: &[(usize, f32)]) -> Morph {
        Morph::new(
            name.to_string(),
            MorphKind::Group(
                children
                    .iter()
                    .map(|&(i, w)| GroupMorphOffset { morph_index: Some(i), influence: w })
                    .collect(),
            ),
        )
    }

    #[test]
    fn test_position_morph_half_weight() {
        let mut manager = MorphManager::new();
        manager.init_buffers(4, 0);
        let idx = manager.add_morph(position_morph("あ", 0, Vec3::new(0.0, 1.0, 0.0)));
        manager.set_morph_weight(idx, 0.5);

        let mut bones = BoneSet::new();
        manager.begin_update();
        manager.apply_morphs(&mut bones);

        let offsets = manager.position_offsets();
        assert_eq!(offsets[0], Vec3::new(0.0, 0.5, 0.0));
        assert!(offsets[1..].iter().all(|o| *o == Vec3::ZERO));
    }

    #[test]
    fn test_self_reference_is_severed() {
        let mut manager = MorphManager::new();
        manager.init_buffers(1, 0);
        manager.add_morph(position_morph("base", 0, Vec3::X));
        manager.add_morph(group("self", &[(1, 1.0), (0, 1.0)]));

        assert_eq!(manager.sever_group_cycles(), 1);
        match &manager.get_morph(1).unwrap().kind {
            MorphKind::Group(offsets) => {
                assert_eq!(offsets[0].morph_index, None);
                assert_eq!(offsets[1].morph_index, Some(0));
            }
            other => panic!("unexpected kind {:?}", other),
        }

        manager.set_morph_weight(1, 1.0);
        manager.begin_update();
        manager.apply_morphs(&mut BoneSet::new());
        assert_eq!(manager.position_offsets()[0], Vec3::X);
    }

    #[test]
    fn test_mutual_reference_terminates() {
        let mut manager = MorphManager::new();
        manager.init_buffers(1, 0);
        manager.add_morph(position_morph("leaf", 0, Vec3::Y));
        manager.add_morph(group("a", &[(2, 1.0), (0, 1.0)]));
        manager.add_morph(group("b", &[(1, 0.5)]));

        // 从 a 开始遍历，b → a 为回边，被切断
        assert_eq!(manager.sever_group_cycles(), 1);
        match &manager.get_morph(2).unwrap().kind {
            MorphKind::Group(offsets) => assert_eq!(offsets[0].morph_index, None),
            other => panic!("unexpected kind {:?}", other),
        }

        manager.set_morph_weight(1, 1.0);
        manager.begin_update();
        manager.apply_morphs(&mut BoneSet::new());
        // a → b（空）+ leaf(1.0)
        assert!(manager.position_offsets()[0].abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn test_runtime_depth_cap_without_severing() {
        let mut manager = MorphManager::new();
        manager.init_buffers(1, 0);
        manager.add_morph(group("loop", &[(0, 1.0)]));
        manager.set_morph_weight(0, 1.0);
        manager.begin_update();
        manager.apply_morphs(&mut BoneSet::new());
        assert_eq!(manager.position_offsets()[0], Vec3::ZERO);
    }

    #[test]
    fn test_material_all_and_single() {
        let mut manager = MorphManager::new();
        manager.init_buffers(0, 2);
        let mut mul = MaterialFactor::ONE;
        mul.diffuse = Vec4::new(0.0, 0.0, 0.0, 1.0);
        let mut add = MaterialFactor::ZERO;
        add.edge_size = 1.0;
        manager.add_morph(Morph::new(
            "mat".to_string(),
            MorphKind::Material(vec![
                MaterialMorphOffset { material_index: None, operation: MaterialMorphOp::Multiply, factor: mul },
                MaterialMorphOffset { material_index: Some(1), operation: MaterialMorphOp::Add, factor: add },
            ]),
        ));
        manager.set_morph_weight(0, 0.5);
        manager.begin_update();
        manager.apply_morphs(&mut BoneSet::new());

        let buffers = manager.buffers();
        for m in &buffers.material_mul {
            assert!(m.diffuse.abs_diff_eq(Vec4::new(0.5, 0.5, 0.5, 1.0), 1e-6));
        }
        assert_eq!(buffers.material_add[0].edge_size, 0.0);
        assert!((buffers.material_add[1].edge_size - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_bone_morph_offsets_current_trs() {
        let mut bones = BoneSet::new();
        bones.add_bone(BoneLink::new("頭".to_string()));
        bones.begin_update();

        let mut manager = MorphManager::new();
        manager.add_morph(Morph::new(
            "nod".to_string(),
            MorphKind::Bone(vec![BoneMorphOffset {
                bone_index: 0,
                translation: Vec3::new(0.0, 2.0, 0.0),
                rotation: Quat::from_rotation_x(1.0),
            }]),
        ));
        manager.set_morph_weight(0, 0.5);
        manager.apply_morphs(&mut bones);

        let bone = &bones.bones()[0];
        assert!(bone.translate.abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-6));
        assert!(bone.rotate.abs_diff_eq(Quat::from_rotation_x(0.5), 1e-5));
    }
}
