//! Motion 核心数据结构
//!
//! 按名称存储骨骼、Morph 和 IK 轨道，以及相机/照明/自阴影关键帧。

use std::collections::HashMap;

use super::keyframe::{
    BoneKeyframe, CameraKeyframe, IkKeyframe, LightKeyframe, MorphKeyframe, ShadowKeyframe,
};
use super::motion_track::{BoneFrameTransform, BoneMotionTrack, IkMotionTrack, MorphMotionTrack, MotionTrack};

/// 动画数据
#[derive(Debug, Clone, Default)]
pub struct Motion {
    /// 骨骼动画轨道（骨骼名称 -> 轨道）
    pub bone_tracks: HashMap<String, BoneMotionTrack>,
    /// Morph 动画轨道（Morph 名称 -> 轨道）
    pub morph_tracks: HashMap<String, MorphMotionTrack>,
    /// IK 动画轨道（IK 骨骼名称 -> 轨道）
    pub ik_tracks: HashMap<String, IkMotionTrack>,
    pub camera_keyframes: Vec<CameraKeyframe>,
    pub light_keyframes: Vec<LightKeyframe>,
    pub shadow_keyframes: Vec<ShadowKeyframe>,
}

impl Motion {
    /// 创建空的 Motion
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取动画持续时间（最大帧索引）
    pub fn duration(&self) -> u32 {
        let bone_max = self.bone_tracks.values().map(|t| t.max_frame_index()).max().unwrap_or(0);
        let morph_max = self.morph_tracks.values().map(|t| t.max_frame_index()).max().unwrap_or(0);
        let ik_max = self.ik_tracks.values().map(|t| t.max_frame_index()).max().unwrap_or(0);
        bone_max.max(morph_max).max(ik_max)
    }

    /// 插入骨骼关键帧
    pub fn insert_bone_keyframe(&mut self, name: &str, keyframe: BoneKeyframe) {
        self.bone_tracks
            .entry(name.to_string())
            .or_default()
            .insert_keyframe(keyframe);
    }

    /// 插入 Morph 关键帧
    pub fn insert_morph_keyframe(&mut self, name: &str, keyframe: MorphKeyframe) {
        self.morph_tracks
            .entry(name.to_string())
            .or_default()
            .insert_keyframe(keyframe);
    }

    /// 插入 IK 关键帧
    pub fn insert_ik_keyframe(&mut self, name: &str, keyframe: IkKeyframe) {
        self.ik_tracks
            .entry(name.to_string())
            .or_default()
            .insert_keyframe(keyframe);
    }

    /// 全部关键帧收集完毕后排序
    pub fn sort_keyframes(&mut self) {
        self.bone_tracks.values_mut().for_each(|t| t.sort());
        self.morph_tracks.values_mut().for_each(|t| t.sort());
        self.ik_tracks.values_mut().for_each(|t| t.sort());
        self.camera_keyframes.sort_by_key(|k| k.frame_index);
        self.light_keyframes.sort_by_key(|k| k.frame_index);
        self.shadow_keyframes.sort_by_key(|k| k.frame_index);
    }

    /// 合并另一个 Motion，对方的关键帧追加在后
    pub fn merge(&mut self, other: Motion) {
        for (name, track) in other.bone_tracks {
            let entry = self.bone_tracks.entry(name).or_default();
            for key in track.keyframes() {
                entry.insert_keyframe(key.clone());
            }
        }
        for (name, track) in other.morph_tracks {
            let entry = self.morph_tracks.entry(name).or_default();
            for key in track.keyframes() {
                entry.insert_keyframe(key.clone());
            }
        }
        for (name, track) in other.ik_tracks {
            let entry = self.ik_tracks.entry(name).or_default();
            for key in track.keyframes() {
                entry.insert_keyframe(key.clone());
            }
        }
        self.camera_keyframes.extend(other.camera_keyframes);
        self.light_keyframes.extend(other.light_keyframes);
        self.shadow_keyframes.extend(other.shadow_keyframes);
        self.sort_keyframes();
    }

    /// 求值骨骼变换，没有轨道时返回 None
    pub fn find_bone_transform(&self, name: &str, time: f32) -> Option<BoneFrameTransform> {
        self.bone_tracks.get(name).map(|track| track.seek(time))
    }

    /// 求值 Morph 权重
    pub fn find_morph_weight(&self, name: &str, time: f32) -> Option<f32> {
        self.morph_tracks.get(name).map(|track| track.seek(time))
    }

    /// 求值 IK 启用状态
    pub fn find_ik_enabled(&self, name: &str, time: f32) -> Option<bool> {
        self.ik_tracks.get(name).map(|track| track.seek(time))
    }

    pub fn contains_bone_track(&self, name: &str) -> bool {
        self.bone_tracks.contains_key(name)
    }

    pub fn contains_morph_track(&self, name: &str) -> bool {
        self.morph_tracks.contains_key(name)
    }

    pub fn bone_track_names(&self) -> impl Iterator<Item = &String> {
        self.bone_tracks.keys()
    }

    pub fn morph_track_names(&self) -> impl Iterator<Item = &String> {
        self.morph_tracks.keys()
    }

    pub fn ik_track_names(&self) -> impl Iterator<Item = &String> {
        self.ik_tracks.keys()
    }

    /// 是否包含相机数据
    pub fn has_camera_data(&self) -> bool {
        !self.camera_keyframes.is_empty()
    }
}
