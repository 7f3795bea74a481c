//! VMD 文件加载器
//!
//! 解析 VMD 动画文件并转换为 Motion 数据

use std::io::{Cursor, Read};
use std::path::Path;

use glam::{Vec3, Quat};
use byteorder::{LittleEndian, ReadBytesExt};

use crate::{MmdError, Result};
use crate::model::MmdModel;
use crate::morph::MorphManager;
use crate::physics::config::get_config;
use crate::skeleton::BoneManager;

use super::bezier_curve::VmdBezier;
use super::motion::Motion;
use super::keyframe::{
    BoneKeyframe, CameraKeyframe, IkKeyframe, LightKeyframe, MorphKeyframe, ShadowKeyframe,
};
use super::motion_track::{BoneFrameTransform, MotionTrack};

/// VMD 文件头
const VMD_HEADER_V1: &[u8] = b"Vocaloid Motion Data file";
const VMD_HEADER_V2: &[u8] = b"Vocaloid Motion Data 0002";

/// VMD 文件数据
#[derive(Debug, Clone)]
pub struct VmdFile {
    /// 模型名称
    pub model_name: String,
    /// Motion 数据
    pub motion: Motion,
}

impl VmdFile {
    /// 从文件路径加载 VMD
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::load_from_bytes(&bytes)
    }

    /// 从字节切片加载 VMD
    ///
    /// 相机、照明、自阴影与 IK 段是可选的，只有在还有剩余字节时才读取；
    /// IK 段之后仍有剩余字节视为文件损坏。
    pub fn load_from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let remaining = |r: &Cursor<&[u8]>| bytes.len().saturating_sub(r.position() as usize);

        // 读取头部
        let mut header = [0u8; 30];
        reader.read_exact(&mut header)
            .map_err(|e| MmdError::VmdParse(format!("Failed to read header: {}", e)))?;

        // 验证头部 (两个头部都是 25 字节)
        let is_v1 = header[..25] == VMD_HEADER_V1[..];
        let is_v2 = header[..25] == VMD_HEADER_V2[..];
        if !is_v1 && !is_v2 {
            return Err(MmdError::VmdParse("Invalid VMD header".to_string()));
        }

        // 读取模型名称 (20 字节)
        let mut model_name_bytes = [0u8; 20];
        reader.read_exact(&mut model_name_bytes)
            .map_err(|e| MmdError::VmdParse(format!("Failed to read model name: {}", e)))?;
        let model_name = decode_shift_jis(&model_name_bytes);

        let mut motion = Motion::new();

        // 骨骼关键帧
        let count = read_count(&mut reader, "bone keyframe")?;
        for _ in 0..count {
            let (name, keyframe) = read_bone_keyframe(&mut reader)?;
            motion.insert_bone_keyframe(&name, keyframe);
        }

        // Morph 关键帧
        let count = read_count(&mut reader, "morph keyframe")?;
        for _ in 0..count {
            let (name, keyframe) = read_morph_keyframe(&mut reader)?;
            motion.insert_morph_keyframe(&name, keyframe);
        }

        // 相机关键帧
        if remaining(&reader) > 0 {
            let count = read_count(&mut reader, "camera keyframe")?;
            for _ in 0..count {
                motion.camera_keyframes.push(read_camera_keyframe(&mut reader)?);
            }
        }

        // 照明关键帧
        if remaining(&reader) > 0 {
            let count = read_count(&mut reader, "light keyframe")?;
            for _ in 0..count {
                motion.light_keyframes.push(read_light_keyframe(&mut reader)?);
            }
        }

        // 自阴影关键帧
        if remaining(&reader) > 0 {
            let count = read_count(&mut reader, "shadow keyframe")?;
            for _ in 0..count {
                motion.shadow_keyframes.push(read_shadow_keyframe(&mut reader)?);
            }
        }

        // IK 启用关键帧
        if remaining(&reader) > 0 {
            let count = read_count(&mut reader, "ik keyframe")?;
            for _ in 0..count {
                read_ik_keyframe(&mut reader, &mut motion)?;
            }
        }

        let rest = remaining(&reader);
        if rest > 0 {
            return Err(MmdError::VmdParse(format!("{} unexpected trailing bytes", rest)));
        }

        motion.sort_keyframes();

        log::info!(
            "VMD 加载完成: 模型 '{}', {} 骨骼轨道, {} Morph 轨道, {} IK 轨道, 最大帧 {}",
            model_name,
            motion.bone_tracks.len(),
            motion.morph_tracks.len(),
            motion.ik_tracks.len(),
            motion.duration()
        );

        Ok(Self {
            model_name,
            motion,
        })
    }

    /// 获取最大帧数
    pub fn max_frame(&self) -> u32 {
        self.motion.duration()
    }
}

fn read_count<R: Read>(reader: &mut R, what: &str) -> Result<u32> {
    reader.read_u32::<LittleEndian>()
        .map_err(|e| MmdError::VmdParse(format!("Failed to read {} count: {}", what, e)))
}

fn read_f32<R: Read>(reader: &mut R, what: &str) -> Result<f32> {
    reader.read_f32::<LittleEndian>()
        .map_err(|e| MmdError::VmdParse(format!("Failed to read {}: {}", what, e)))
}

fn read_u32<R: Read>(reader: &mut R, what: &str) -> Result<u32> {
    reader.read_u32::<LittleEndian>()
        .map_err(|e| MmdError::VmdParse(format!("Failed to read {}: {}", what, e)))
}

fn read_u8<R: Read>(reader: &mut R, what: &str) -> Result<u8> {
    reader.read_u8()
        .map_err(|e| MmdError::VmdParse(format!("Failed to read {}: {}", what, e)))
}

fn read_vec3<R: Read>(reader: &mut R, what: &str) -> Result<Vec3> {
    let x = read_f32(reader, what)?;
    let y = read_f32(reader, what)?;
    let z = read_f32(reader, what)?;
    Ok(Vec3::new(x, y, z))
}

fn read_name<R: Read, const N: usize>(reader: &mut R, what: &str) -> Result<String> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)
        .map_err(|e| MmdError::VmdParse(format!("Failed to read {}: {}", what, e)))?;
    Ok(decode_shift_jis(&bytes))
}

/// 读取骨骼关键帧
fn read_bone_keyframe<R: Read>(reader: &mut R) -> Result<(String, BoneKeyframe)> {
    // 骨骼名称 (15 字节)
    let name = read_name::<R, 15>(reader, "bone name")?;
    let frame_index = read_u32(reader, "frame index")?;

    let t = read_vec3(reader, "translation")?;
    let rx = read_f32(reader, "rotation")?;
    let ry = read_f32(reader, "rotation")?;
    let rz = read_f32(reader, "rotation")?;
    let rw = read_f32(reader, "rotation")?;

    // 插值参数 (64 字节)
    let mut interpolation = [0u8; 64];
    reader.read_exact(&mut interpolation)
        .map_err(|e| MmdError::VmdParse(format!("Failed to read interpolation: {}", e)))?;

    // VMD 插值数据布局：每行 16 字节，共 4 行，只使用第一行
    // 格式：X_x1, Y_x1, Z_x1, R_x1, X_y1, Y_y1, Z_y1, R_y1, X_x2, ...
    let curve = |axis: usize| {
        VmdBezier::from_parameters([
            interpolation[axis],
            interpolation[axis + 4],
            interpolation[axis + 8],
            interpolation[axis + 12],
        ])
    };

    // 坐标系转换：Z 轴和 W 分量反转
    let translation = Vec3::new(t.x, t.y, -t.z);
    let orientation = Quat::from_xyzw(rx, ry, -rz, -rw);
    let orientation = if orientation.length_squared() > f32::EPSILON {
        orientation.normalize()
    } else {
        Quat::IDENTITY
    };

    let keyframe = BoneKeyframe {
        frame_index,
        translation,
        orientation,
        interpolation_x: curve(0),
        interpolation_y: curve(1),
        interpolation_z: curve(2),
        interpolation_r: curve(3),
    };

    Ok((name, keyframe))
}

/// 读取 Morph 关键帧
fn read_morph_keyframe<R: Read>(reader: &mut R) -> Result<(String, MorphKeyframe)> {
    // Morph 名称 (15 字节)
    let name = read_name::<R, 15>(reader, "morph name")?;
    let frame_index = read_u32(reader, "frame index")?;
    let weight = read_f32(reader, "weight")?;

    Ok((name, MorphKeyframe { frame_index, weight }))
}

fn read_camera_keyframe<R: Read>(reader: &mut R) -> Result<CameraKeyframe> {
    let frame_index = read_u32(reader, "camera frame index")?;
    let distance = read_f32(reader, "camera distance")?;
    let interest = read_vec3(reader, "camera interest")?;
    let rotation = read_vec3(reader, "camera rotation")?;
    let mut interpolation = [0u8; 24];
    reader.read_exact(&mut interpolation)
        .map_err(|e| MmdError::VmdParse(format!("Failed to read camera interpolation: {}", e)))?;
    let view_angle = read_u32(reader, "camera view angle")?;
    let perspective = read_u8(reader, "camera perspective")? == 0;

    Ok(CameraKeyframe {
        frame_index,
        distance,
        interest,
        rotation,
        interpolation,
        view_angle,
        perspective,
    })
}

fn read_light_keyframe<R: Read>(reader: &mut R) -> Result<LightKeyframe> {
    Ok(LightKeyframe {
        frame_index: read_u32(reader, "light frame index")?,
        color: read_vec3(reader, "light color")?,
        position: read_vec3(reader, "light position")?,
    })
}

fn read_shadow_keyframe<R: Read>(reader: &mut R) -> Result<ShadowKeyframe> {
    Ok(ShadowKeyframe {
        frame_index: read_u32(reader, "shadow frame index")?,
        mode: read_u8(reader, "shadow mode")?,
        distance: read_f32(reader, "shadow distance")?,
    })
}

/// IK 关键帧：帧号、显示标志，以及 (名称, 启用) 列表
fn read_ik_keyframe<R: Read>(reader: &mut R, motion: &mut Motion) -> Result<()> {
    let frame_index = read_u32(reader, "ik frame index")?;
    let _show = read_u8(reader, "ik show flag")?;
    let count = read_count(reader, "ik info")?;
    for _ in 0..count {
        let name = read_name::<R, 20>(reader, "ik name")?;
        let enabled = read_u8(reader, "ik enable flag")? != 0;
        motion.insert_ik_keyframe(&name, IkKeyframe { frame_index, enabled });
    }
    Ok(())
}

/// 解码 Shift-JIS 字符串
pub(crate) fn decode_shift_jis(bytes: &[u8]) -> String {
    // 找到第一个 null 字节
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let bytes = &bytes[..end];

    // 使用 encoding_rs 解码
    let (decoded, _, _) = encoding_rs::SHIFT_JIS.decode(bytes);
    decoded.into_owned()
}

// ============================================================================
// 运行时动画
// ============================================================================

/// VMD 动画（运行时使用）
#[derive(Debug, Clone)]
pub struct VmdAnimation {
    /// Motion 数据
    motion: Motion,
}

impl VmdAnimation {
    /// 从 VmdFile 创建
    pub fn from_vmd_file(vmd: VmdFile) -> Self {
        Self {
            motion: vmd.motion,
        }
    }

    /// 从 Motion 创建
    pub fn from_motion(mut motion: Motion) -> Self {
        motion.sort_keyframes();
        Self { motion }
    }

    /// 从文件路径加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let vmd = VmdFile::load(path)?;
        Ok(Self::from_vmd_file(vmd))
    }

    /// 从字节加载
    pub fn load_from_bytes(bytes: &[u8]) -> Result<Self> {
        let vmd = VmdFile::load_from_bytes(bytes)?;
        Ok(Self::from_vmd_file(vmd))
    }

    /// 追加另一段动画的关键帧
    pub fn add(&mut self, vmd: VmdFile) {
        self.motion.merge(vmd.motion);
    }

    pub fn motion(&self) -> &Motion {
        &self.motion
    }

    /// 获取最大帧数
    pub fn max_frame(&self) -> u32 {
        self.motion.duration()
    }

    /// 获取骨骼帧变换
    pub fn get_bone_transform(&self, name: &str, time: f32) -> BoneFrameTransform {
        self.motion.find_bone_transform(name, time).unwrap_or_default()
    }

    /// 获取 Morph 权重
    pub fn get_morph_weight(&self, name: &str, time: f32) -> f32 {
        self.motion.find_morph_weight(name, time).unwrap_or(0.0)
    }

    /// 评估动画并应用到骨骼、IK 和 Morph
    pub fn evaluate(
        &self,
        time: f32,
        bone_manager: &mut BoneManager,
        morph_manager: &mut MorphManager,
    ) {
        self.evaluate_with_weight(time, 1.0, bone_manager, morph_manager);
    }

    /// 带权重评估动画
    ///
    /// weight < 1 时与基础动画快照混合：骨骼 lerp/slerp，Morph 线性混合，
    /// IK 使用快照中的启用状态。模型中不存在的名字忽略。
    pub fn evaluate_with_weight(
        &self,
        time: f32,
        weight: f32,
        bone_manager: &mut BoneManager,
        morph_manager: &mut MorphManager,
    ) {
        // 骨骼
        for (name, track) in &self.motion.bone_tracks {
            let Some(bone_idx) = bone_manager.find_bone_by_name(name) else {
                continue;
            };
            let transform = track.seek(time);
            if let Some(bone) = bone_manager.get_bone_mut(bone_idx) {
                if weight >= 1.0 {
                    bone.animation_translate = transform.translation;
                    bone.animation_rotate = transform.orientation;
                } else {
                    bone.animation_translate = bone.base_animation_translate.lerp(transform.translation, weight);
                    bone.animation_rotate = bone.base_animation_rotate.slerp(transform.orientation, weight);
                }
            }
        }

        // IK
        for (name, track) in &self.motion.ik_tracks {
            let Some(solver_idx) = bone_manager.find_ik_solver_by_name(name) else {
                continue;
            };
            let enabled = track.seek(time);
            if let Some(solver) = bone_manager.ik_solvers_mut().get_mut(solver_idx) {
                solver.enabled = if weight >= 1.0 {
                    enabled
                } else {
                    solver.base_animation_enabled
                };
            }
        }

        // Morph
        for (name, track) in &self.motion.morph_tracks {
            let Some(morph_idx) = morph_manager.find_morph_by_name(name) else {
                continue;
            };
            let value = track.seek(time);
            if let Some(morph) = morph_manager.get_morph_mut(morph_idx) {
                let base = morph.base_animation_weight;
                morph.weight = base + (value - base) * weight;
            }
        }
    }

    /// 评估并应用到模型
    pub fn evaluate_model(&self, model: &mut MmdModel, time: f32, weight: f32) {
        self.evaluate_with_weight(time, weight, &mut model.bone_manager, &mut model.morph_manager);
    }

    /// 物理同步
    ///
    /// 从当前姿势（保存为基础动画）经 frame_count 个子帧过渡到 time 处的姿势，
    /// 每个子帧以 `sync_step` 推进物理，使动态刚体平稳跟上。返回物理子步总数。
    pub fn sync_physics(&self, model: &mut MmdModel, time: f32, frame_count: u32) -> u32 {
        let frame_count = frame_count.max(1);
        let step = get_config().sync_step;

        model.save_base_animation();

        let mut substeps = 0;
        for i in 0..frame_count {
            let weight = (1 + i) as f32 / frame_count as f32;
            substeps += self.sync_physics_frame(model, time, weight, step);
        }
        log::debug!("物理同步: time={}, 子帧={}, 子步={}", time, frame_count, substeps);
        substeps
    }

    /// 物理同步的单个子帧：按 weight 混合基础动画与 time 处的姿势，物理推进 step 秒
    ///
    /// 调用前需已保存基础动画。
    pub fn sync_physics_frame(&self, model: &mut MmdModel, time: f32, weight: f32, step: f32) -> u32 {
        model.begin_animation();
        self.evaluate_model(model, time, weight);
        model.update_morph_animation();
        model.update_node_animation(false);
        let substeps = model.update_physics_animation(step);
        model.update_node_animation(true);
        model.end_animation();
        substeps
    }

    /// 检查是否包含骨骼轨道
    pub fn contains_bone_track(&self, name: &str) -> bool {
        self.motion.contains_bone_track(name)
    }

    /// 检查是否包含 Morph 轨道
    pub fn contains_morph_track(&self, name: &str) -> bool {
        self.motion.contains_morph_track(name)
    }

    /// 获取骨骼轨道名称列表
    pub fn bone_track_names(&self) -> Vec<String> {
        self.motion.bone_track_names().cloned().collect()
    }

    /// 获取 Morph 轨道名称列表
    pub fn morph_track_names(&self) -> Vec<String> {
        self.motion.morph_track_names().cloned().collect()
    }
}
