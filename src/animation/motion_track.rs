//! 动画轨道
//!
//! 存储单个骨骼、Morph 或 IK 的全部关键帧，并提供查找和插值功能。
//! 关键帧在插入后需要调用 `sort` 按帧索引稳定排序。

use std::sync::atomic::{AtomicUsize, Ordering};

use glam::{Vec3, Quat};

use super::bezier_curve::Curve;
use super::keyframe::{BoneKeyframe, IkKeyframe, Keyframe, MorphKeyframe};

/// 骨骼帧变换结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoneFrameTransform {
    /// 平移
    pub translation: Vec3,
    /// 旋转
    pub orientation: Quat,
}

impl Default for BoneFrameTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            orientation: Quat::IDENTITY,
        }
    }
}

/// 动画轨道 trait
pub trait MotionTrack {
    type Frame;

    /// 求值指定时刻（浮点帧）
    fn seek(&self, time: f32) -> Self::Frame;

    /// 获取轨道长度
    fn len(&self) -> usize;

    /// 是否为空
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 获取最大帧索引
    fn max_frame_index(&self) -> u32;
}

// ============================================================================
// 通用关键帧序列
// ============================================================================

/// 关键帧序列
///
/// 播放通常是顺序前进的，`start_hint` 缓存上次查找的位置以避免每帧二分。
/// 提示只影响查找起点，不影响结果；跨线程读写用 Relaxed。
#[derive(Debug)]
pub struct KeyframeTrack<K> {
    keyframes: Vec<K>,
    start_hint: AtomicUsize,
}

impl<K> Default for KeyframeTrack<K> {
    fn default() -> Self {
        Self {
            keyframes: Vec::new(),
            start_hint: AtomicUsize::new(0),
        }
    }
}

impl<K: Clone> Clone for KeyframeTrack<K> {
    fn clone(&self) -> Self {
        Self {
            keyframes: self.keyframes.clone(),
            start_hint: AtomicUsize::new(self.start_hint.load(Ordering::Relaxed)),
        }
    }
}

impl<K: Keyframe> KeyframeTrack<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加关键帧（不排序）
    pub fn insert_keyframe(&mut self, keyframe: K) {
        self.keyframes.push(keyframe);
    }

    /// 按帧索引稳定排序，同帧关键帧保持插入顺序
    pub fn sort(&mut self) {
        self.keyframes.sort_by_key(|k| k.frame_index());
        self.start_hint.store(0, Ordering::Relaxed);
    }

    pub fn keyframes(&self) -> &[K] {
        &self.keyframes
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn max_frame_index(&self) -> u32 {
        self.keyframes.last().map(|k| k.frame_index()).unwrap_or(0)
    }

    /// 第一个帧索引大于 time 的关键帧位置（upper bound）
    pub fn find_bound(&self, time: f32) -> usize {
        let keys = &self.keyframes;
        if keys.is_empty() {
            return 0;
        }

        let hint = self.start_hint.load(Ordering::Relaxed).min(keys.len() - 1);
        let bound = if (keys[hint].frame_index() as f32) <= time {
            if hint + 1 == keys.len() {
                keys.len()
            } else if (keys[hint + 1].frame_index() as f32) > time {
                hint + 1
            } else {
                keys.partition_point(|k| (k.frame_index() as f32) <= time)
            }
        } else if hint > 0 && (keys[hint - 1].frame_index() as f32) <= time {
            hint
        } else {
            keys.partition_point(|k| (k.frame_index() as f32) <= time)
        };

        self.start_hint.store(bound.saturating_sub(1), Ordering::Relaxed);
        bound
    }

    /// 取区间 (key0, key1, 比例)；越界时返回端点关键帧
    fn bracket(&self, time: f32) -> Option<Bracket<'_, K>> {
        let keys = &self.keyframes;
        let bound = self.find_bound(time);
        if keys.is_empty() {
            None
        } else if bound == keys.len() {
            keys.last().map(Bracket::Single)
        } else if bound == 0 {
            keys.first().map(Bracket::Single)
        } else {
            let key0 = &keys[bound - 1];
            let key1 = &keys[bound];
            let range = (key1.frame_index() - key0.frame_index()) as f32;
            let x = (time - key0.frame_index() as f32) / range;
            Some(Bracket::Between(key0, key1, x.clamp(0.0, 1.0)))
        }
    }
}

enum Bracket<'a, K> {
    Single(&'a K),
    Between(&'a K, &'a K, f32),
}

// ============================================================================
// 骨骼轨道
// ============================================================================

/// 骨骼动画轨道
pub type BoneMotionTrack = KeyframeTrack<BoneKeyframe>;

impl MotionTrack for KeyframeTrack<BoneKeyframe> {
    type Frame = BoneFrameTransform;

    /// 区间内 X/Y/Z 平移与旋转各自使用后一关键帧的贝塞尔曲线
    fn seek(&self, time: f32) -> Self::Frame {
        match self.bracket(time) {
            None => BoneFrameTransform::default(),
            Some(Bracket::Single(key)) => BoneFrameTransform {
                translation: key.translation,
                orientation: key.orientation,
            },
            Some(Bracket::Between(key0, key1, x)) => {
                let amounts = Vec3::new(
                    key1.interpolation_x.value(x),
                    key1.interpolation_y.value(x),
                    key1.interpolation_z.value(x),
                );
                let translation = key0.translation + (key1.translation - key0.translation) * amounts;
                let amount = key1.interpolation_r.value(x);
                let orientation = key0.orientation.slerp(key1.orientation, amount);
                BoneFrameTransform {
                    translation,
                    orientation,
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.keyframes.len()
    }

    fn max_frame_index(&self) -> u32 {
        KeyframeTrack::max_frame_index(self)
    }
}

// ============================================================================
// Morph 轨道
// ============================================================================

/// Morph 动画轨道（线性插值）
pub type MorphMotionTrack = KeyframeTrack<MorphKeyframe>;

impl MotionTrack for KeyframeTrack<MorphKeyframe> {
    type Frame = f32;

    fn seek(&self, time: f32) -> Self::Frame {
        match self.bracket(time) {
            None => 0.0,
            Some(Bracket::Single(key)) => key.weight,
            Some(Bracket::Between(key0, key1, x)) => key0.weight + (key1.weight - key0.weight) * x,
        }
    }

    fn len(&self) -> usize {
        self.keyframes.len()
    }

    fn max_frame_index(&self) -> u32 {
        KeyframeTrack::max_frame_index(self)
    }
}

// ============================================================================
// IK 轨道
// ============================================================================

/// IK 启用轨道（阶梯，不插值）
pub type IkMotionTrack = KeyframeTrack<IkKeyframe>;

impl MotionTrack for KeyframeTrack<IkKeyframe> {
    type Frame = bool;

    /// 取 time 之前（含）最后一个关键帧；早于首帧时取首帧
    fn seek(&self, time: f32) -> Self::Frame {
        let bound = self.find_bound(time);
        match bound {
            0 => self.keyframes.first().map(|k| k.enabled).unwrap_or(true),
            b => self.keyframes[b - 1].enabled,
        }
    }

    fn len(&self) -> usize {
        self.keyframes.len()
    }

    fn max_frame_index(&self) -> u32 {
        KeyframeTrack::max_frame_index(self)
    }
}
