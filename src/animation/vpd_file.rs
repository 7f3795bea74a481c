//! VPD (Vocaloid Pose Data) 文件解析
//!
//! VPD 是 Shift-JIS 编码的文本文件，包含骨骼位姿和 Morph 表情数据。
//! Morph 数据是 MMM (MikuMikuMoving) 的扩展，但被广泛支持。
//!
//! ```text
//! Vocaloid Pose Data file
//!
//! miku.osm;       // 親ファイル名
//! 1;              // 総ポーズボーン数
//!
//! Bone0{右髪１
//!   0.000000,0.000000,0.000000;         // trans x,y,z
//!   0.000000,0.000000,0.000000,1.000000; // Quaternion x,y,z,w
//! }
//!
//! Morph0{まばたき
//!   0.500000;
//! }
//! ```

use std::fs;
use std::path::Path;

use glam::{Vec3, Quat};

use crate::{Result, MmdError};
use crate::model::MmdModel;
use crate::morph::MorphManager;
use crate::skeleton::BoneManager;

const VPD_HEADER: &str = "Vocaloid Pose Data file";

/// VPD 骨骼数据（已转换到右手坐标系）
#[derive(Clone, Debug, PartialEq)]
pub struct VpdBone {
    pub name: String,
    pub translation: Vec3,
    pub rotation: Quat,
}

/// VPD Morph 数据
#[derive(Clone, Debug, PartialEq)]
pub struct VpdMorph {
    pub name: String,
    pub weight: f32,
}

/// VPD 文件数据
#[derive(Clone, Debug)]
pub struct VpdFile {
    pub model_name: String,
    pub bones: Vec<VpdBone>,
    pub morphs: Vec<VpdMorph>,
}

/// 解析状态
enum State {
    Header,
    ModelName,
    BoneCount,
    Block,
    BoneTrans(String),
    BoneQuat(String, Vec3),
    BoneEnd,
    MorphWeight(String),
    MorphEnd,
}

impl VpdFile {
    /// 从文件加载 VPD
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::load_from_bytes(&bytes)
    }

    /// 从 Shift-JIS 字节解析
    pub fn load_from_bytes(bytes: &[u8]) -> Result<Self> {
        let (content, _, _) = encoding_rs::SHIFT_JIS.decode(bytes);
        Self::parse(&content)
    }

    /// 解析已解码的文本
    pub fn parse(content: &str) -> Result<Self> {
        let mut model_name = String::new();
        let mut bone_count = 0usize;
        let mut bones = Vec::new();
        let mut morphs = Vec::new();
        let mut state = State::Header;

        for (line_index, raw) in content.lines().enumerate() {
            let line_no = line_index + 1;
            let err = |msg: &str| MmdError::VpdParse(format!("line {}: {}", line_no, msg));

            let line = raw.split("//").next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            state = match state {
                State::Header => {
                    if !line.starts_with(VPD_HEADER) {
                        return Err(err("invalid VPD header"));
                    }
                    State::ModelName
                }
                State::ModelName => {
                    model_name = line
                        .strip_suffix(';')
                        .ok_or_else(|| err("model name must end with ';'"))?
                        .trim()
                        .to_string();
                    State::BoneCount
                }
                State::BoneCount => {
                    let value = line
                        .strip_suffix(';')
                        .ok_or_else(|| err("bone count must end with ';'"))?;
                    bone_count = value
                        .trim()
                        .parse()
                        .map_err(|_| err(&format!("invalid bone count '{}'", value)))?;
                    State::Block
                }
                State::Block => {
                    let (kind, name) = parse_block_start(line).ok_or_else(|| {
                        err(&format!("expected 'BoneN{{name' or 'MorphN{{name', found '{}'", line))
                    })?;
                    match kind {
                        BlockKind::Bone => State::BoneTrans(name),
                        BlockKind::Morph => State::MorphWeight(name),
                    }
                }
                State::BoneTrans(name) => {
                    let v = parse_floats::<3>(line).ok_or_else(|| err("expected 'x,y,z;'"))?;
                    State::BoneQuat(name, Vec3::new(v[0], v[1], -v[2]))
                }
                State::BoneQuat(name, translation) => {
                    let q = parse_floats::<4>(line).ok_or_else(|| err("expected 'x,y,z,w;'"))?;
                    let rotation = Quat::from_xyzw(q[0], q[1], -q[2], -q[3]);
                    let rotation = if rotation.length_squared() > f32::EPSILON {
                        rotation.normalize()
                    } else {
                        Quat::IDENTITY
                    };
                    bones.push(VpdBone { name, translation, rotation });
                    State::BoneEnd
                }
                State::MorphWeight(name) => {
                    let w = parse_floats::<1>(line).ok_or_else(|| err("expected 'weight;'"))?;
                    morphs.push(VpdMorph { name, weight: w[0] });
                    State::MorphEnd
                }
                State::BoneEnd | State::MorphEnd => {
                    if line != "}" {
                        return Err(err(&format!("expected '}}', found '{}'", line)));
                    }
                    State::Block
                }
            };
        }

        match state {
            State::Block => {}
            State::Header => return Err(MmdError::VpdParse("empty VPD file".to_string())),
            _ => return Err(MmdError::VpdParse("unexpected end of file".to_string())),
        }

        if bone_count != bones.len() {
            log::warn!("VPD 声明 {} 个骨骼，实际读取 {} 个", bone_count, bones.len());
        }
        log::info!("VPD 解析完成: {} 个骨骼, {} 个表情", bones.len(), morphs.len());

        Ok(Self {
            model_name,
            bones,
            morphs,
        })
    }

    /// 获取 Morph 数量
    pub fn morph_count(&self) -> usize {
        self.morphs.len()
    }

    /// 获取骨骼数量
    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    /// 应用姿势
    ///
    /// weight < 1 时与基础动画快照混合，规则与 VMD 求值相同。
    /// 返回应用成功的 (骨骼数, Morph 数)。
    pub fn apply(
        &self,
        weight: f32,
        bone_manager: &mut BoneManager,
        morph_manager: &mut MorphManager,
    ) -> (usize, usize) {
        let mut applied_bones = 0;
        for pose in &self.bones {
            let Some(idx) = bone_manager.find_bone_by_name(&pose.name) else {
                continue;
            };
            if let Some(bone) = bone_manager.get_bone_mut(idx) {
                if weight >= 1.0 {
                    bone.animation_translate = pose.translation;
                    bone.animation_rotate = pose.rotation;
                } else {
                    bone.animation_translate = bone.base_animation_translate.lerp(pose.translation, weight);
                    bone.animation_rotate = bone.base_animation_rotate.slerp(pose.rotation, weight);
                }
                applied_bones += 1;
            }
        }

        let mut applied_morphs = 0;
        for pose in &self.morphs {
            let Some(idx) = morph_manager.find_morph_by_name(&pose.name) else {
                continue;
            };
            if let Some(morph) = morph_manager.get_morph_mut(idx) {
                let base = morph.base_animation_weight;
                morph.weight = base + (pose.weight - base) * weight;
                applied_morphs += 1;
            }
        }

        (applied_bones, applied_morphs)
    }

    /// 应用到模型
    pub fn apply_to_model(&self, model: &mut MmdModel, weight: f32) -> (usize, usize) {
        self.apply(weight, &mut model.bone_manager, &mut model.morph_manager)
    }
}

enum BlockKind {
    Bone,
    Morph,
}

/// `Bone12{name` / `Morph3{name`
fn parse_block_start(line: &str) -> Option<(BlockKind, String)> {
    let (head, name) = line.split_once('{')?;
    let (kind, digits) = if let Some(rest) = head.strip_prefix("Bone") {
        (BlockKind::Bone, rest)
    } else if let Some(rest) = head.strip_prefix("Morph") {
        (BlockKind::Morph, rest)
    } else {
        return None;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((kind, name.to_string()))
}

/// `a,b,c;` → [a, b, c]，数量必须一致
fn parse_floats<const N: usize>(line: &str) -> Option<[f32; N]> {
    let body = line.strip_suffix(';')?;
    let mut out = [0.0f32; N];
    let mut parts = body.split(',');
    for slot in out.iter_mut() {
        *slot = parts.next()?.trim().parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morph::{Morph, MorphKind};
    use crate::skeleton::BoneLink;

    const POSE: &str = "Vocaloid Pose Data file\r\n\
\r\n\
miku.osm;\t\t// 親ファイル名\r\n\
1;\t\t\t\t// 総ポーズボーン数\r\n\
\r\n\
Bone0{右髪１\r\n\
  0.100000,0.200000,0.300000;\t\t\t\t// trans x,y,z\r\n\
  0.000000,0.000000,0.000000,1.000000;\t\t// Quaternion x,y,z,w\r\n\
}\r\n\
\r\n\
Morph0{まばたき\r\n\
  0.500000;\r\n\
}\r\n";

    #[test]
    fn test_parse_pose() {
        let vpd = VpdFile::parse(POSE).unwrap();
        assert_eq!(vpd.model_name, "miku.osm");
        assert_eq!(vpd.bone_count(), 1);
        assert_eq!(vpd.bones[0].name, "右髪１");
        assert!(vpd.bones[0].translation.abs_diff_eq(Vec3::new(0.1, 0.2, -0.3), 1e-6));
        assert_eq!(vpd.morphs[0], VpdMorph { name: "まばたき".to_string(), weight: 0.5 });
    }

    #[test]
    fn test_shift_jis_bytes() {
        let (bytes, _, _) = encoding_rs::SHIFT_JIS.encode(POSE);
        let vpd = VpdFile::load_from_bytes(&bytes).unwrap();
        assert_eq!(vpd.morphs[0].name, "まばたき");
    }

    #[test]
    fn test_bad_header() {
        let err = VpdFile::parse("Not a pose\n").unwrap_err();
        assert!(matches!(err, MmdError::VpdParse(msg) if msg.starts_with("line 1")));
    }

    #[test]
    fn test_malformed_quaternion_reports_line() {
        let broken = POSE.replace("0.000000,0.000000,0.000000,1.000000;", "0.0,0.0;");
        let err = VpdFile::parse(&broken).unwrap_err();
        assert!(matches!(err, MmdError::VpdParse(msg) if msg.starts_with("line 8")));
    }

    #[test]
    fn test_unterminated_block() {
        let cut = POSE.split("Morph0").next().unwrap().to_string() + "Morph0{あ\n0.5;\n";
        assert!(VpdFile::parse(&cut).is_err());
    }

    #[test]
    fn test_apply_with_weight() {
        let vpd = VpdFile::parse(POSE).unwrap();
        let mut bones = BoneManager::new();
        bones.add_bone(BoneLink::new("右髪１".to_string()));
        let mut morphs = MorphManager::new();
        morphs.add_morph(Morph::new("まばたき".to_string(), MorphKind::Position(Vec::new())));

        let applied = vpd.apply(0.5, &mut bones, &mut morphs);
        assert_eq!(applied, (1, 1));
        assert!(bones.bones()[0].animation_translate.abs_diff_eq(Vec3::new(0.05, 0.1, -0.15), 1e-6));
        assert!((morphs.get_morph_weight(0) - 0.25).abs() < 1e-6);
    }
}
