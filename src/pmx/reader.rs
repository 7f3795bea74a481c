//! PMX 二进制读取器
//!
//! 小端序。索引宽度由头部决定：顶点索引无符号，其余索引有符号且 -1 表示无。

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use glam::{Vec2, Vec3, Vec4};

use crate::{MmdError, Result};

use super::*;

const PMX_MAGIC: &[u8; 4] = b"PMX ";

/// PMX 读取器
pub struct PmxReader<'a> {
    cursor: Cursor<&'a [u8]>,
    header: Option<PmxHeader>,
}

impl<'a> PmxReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
            header: None,
        }
    }

    /// 读取完整模型
    pub fn read_model(mut self) -> Result<PmxModel> {
        let header = self.read_header()?;
        self.header = Some(header.clone());

        let info = PmxModelInfo {
            name: self.read_text("model name")?,
            name_en: self.read_text("model english name")?,
            comment: self.read_text("comment")?,
            comment_en: self.read_text("english comment")?,
        };

        let vertex_count = self.read_count("vertex count")?;
        let mut vertices = Vec::with_capacity(vertex_count.min(1 << 16));
        for i in 0..vertex_count {
            vertices.push(self.read_vertex(i, &header)?);
        }

        let index_count = self.read_count("face index count")?;
        let mut indices = Vec::with_capacity(index_count.min(1 << 16));
        for _ in 0..index_count {
            indices.push(self.read_vertex_index(header.vertex_index_size, "face index")?);
        }

        let texture_count = self.read_count("texture count")?;
        let mut textures = Vec::with_capacity(texture_count.min(1 << 10));
        for _ in 0..texture_count {
            textures.push(self.read_text("texture path")?);
        }

        let material_count = self.read_count("material count")?;
        let mut materials = Vec::with_capacity(material_count.min(1 << 10));
        for _ in 0..material_count {
            materials.push(self.read_material(&header)?);
        }

        let bone_count = self.read_count("bone count")?;
        let mut bones = Vec::with_capacity(bone_count.min(1 << 12));
        for _ in 0..bone_count {
            bones.push(self.read_bone(&header)?);
        }

        let morph_count = self.read_count("morph count")?;
        let mut morphs = Vec::with_capacity(morph_count.min(1 << 12));
        for _ in 0..morph_count {
            morphs.push(self.read_morph(&header)?);
        }

        // 显示枠仅做结构性跳过
        let frame_count = self.read_count("display frame count")?;
        for _ in 0..frame_count {
            self.skip_display_frame(&header)?;
        }

        let rigid_body_count = self.read_count("rigid body count")?;
        let mut rigid_bodies = Vec::with_capacity(rigid_body_count.min(1 << 12));
        for _ in 0..rigid_body_count {
            rigid_bodies.push(self.read_rigid_body(&header)?);
        }

        let joint_count = self.read_count("joint count")?;
        let mut joints = Vec::with_capacity(joint_count.min(1 << 12));
        for _ in 0..joint_count {
            joints.push(self.read_joint(&header)?);
        }

        // PMX 2.1 的软体数据不使用

        log::info!(
            "PMX 解析完成: '{}' v{:.1}, {} 顶点, {} 材质, {} 骨骼, {} Morph, {} 刚体, {} 关节",
            info.name, header.version, vertices.len(), materials.len(),
            bones.len(), morphs.len(), rigid_bodies.len(), joints.len()
        );

        Ok(PmxModel {
            header,
            info,
            vertices,
            indices,
            textures,
            materials,
            bones,
            morphs,
            rigid_bodies,
            joints,
        })
    }

    // ========================================================================
    // 头部
    // ========================================================================

    fn read_header(&mut self) -> Result<PmxHeader> {
        let mut magic = [0u8; 4];
        self.cursor.read_exact(&mut magic)
            .map_err(|e| MmdError::PmxParse(format!("Failed to read magic: {}", e)))?;
        if &magic != PMX_MAGIC {
            return Err(MmdError::PmxParse("Invalid PMX magic".to_string()));
        }

        let version = self.read_f32("version")?;
        if !(2.0..=2.1).contains(&version) {
            return Err(MmdError::PmxParse(format!("Unsupported PMX version: {}", version)));
        }

        let globals_count = self.read_u8("globals count")? as usize;
        if globals_count < 8 {
            return Err(MmdError::PmxParse(format!("Invalid globals count: {}", globals_count)));
        }
        let mut globals = vec![0u8; globals_count];
        self.cursor.read_exact(&mut globals)
            .map_err(|e| MmdError::PmxParse(format!("Failed to read globals: {}", e)))?;

        let encoding = match globals[0] {
            0 => TextEncoding::Utf16Le,
            1 => TextEncoding::Utf8,
            other => {
                return Err(MmdError::PmxParse(format!("Invalid text encoding: {}", other)));
            }
        };
        if globals[1] > 4 {
            return Err(MmdError::PmxParse(format!("Invalid additional UV count: {}", globals[1])));
        }
        for (i, &size) in globals[2..8].iter().enumerate() {
            if !matches!(size, 1 | 2 | 4) {
                return Err(MmdError::PmxParse(format!("Invalid index size {} at globals[{}]", size, i + 2)));
            }
        }

        Ok(PmxHeader {
            version,
            encoding,
            additional_uv_count: globals[1],
            vertex_index_size: globals[2],
            texture_index_size: globals[3],
            material_index_size: globals[4],
            bone_index_size: globals[5],
            morph_index_size: globals[6],
            rigid_body_index_size: globals[7],
        })
    }

    // ========================================================================
    // 顶点 / 材质
    // ========================================================================

    fn read_vertex(&mut self, index: usize, header: &PmxHeader) -> Result<PmxVertex> {
        let position = self.read_vec3("vertex position")?;
        let normal = self.read_vec3("vertex normal")?;
        let uv = self.read_vec2("vertex uv")?;
        let mut additional_uvs = Vec::with_capacity(header.additional_uv_count as usize);
        for _ in 0..header.additional_uv_count {
            additional_uvs.push(self.read_vec4("additional uv")?);
        }

        let bone_size = header.bone_index_size;
        let weight_type = self.read_u8("weight type")?;
        let weight = match weight_type {
            0 => PmxVertexWeight::Bdef1 {
                bone: self.read_index(bone_size, "bdef1 bone")?,
            },
            1 => PmxVertexWeight::Bdef2 {
                bones: [
                    self.read_index(bone_size, "bdef2 bone")?,
                    self.read_index(bone_size, "bdef2 bone")?,
                ],
                weight: self.read_f32("bdef2 weight")?,
            },
            2 | 4 => {
                let bones = [
                    self.read_index(bone_size, "bdef4 bone")?,
                    self.read_index(bone_size, "bdef4 bone")?,
                    self.read_index(bone_size, "bdef4 bone")?,
                    self.read_index(bone_size, "bdef4 bone")?,
                ];
                let weights = [
                    self.read_f32("bdef4 weight")?,
                    self.read_f32("bdef4 weight")?,
                    self.read_f32("bdef4 weight")?,
                    self.read_f32("bdef4 weight")?,
                ];
                if weight_type == 2 {
                    PmxVertexWeight::Bdef4 { bones, weights }
                } else {
                    PmxVertexWeight::Qdef { bones, weights }
                }
            }
            3 => PmxVertexWeight::Sdef {
                bones: [
                    self.read_index(bone_size, "sdef bone")?,
                    self.read_index(bone_size, "sdef bone")?,
                ],
                weight: self.read_f32("sdef weight")?,
                c: self.read_vec3("sdef c")?,
                r0: self.read_vec3("sdef r0")?,
                r1: self.read_vec3("sdef r1")?,
            },
            other => {
                log::warn!("顶点 {} 的权重类型 {} 未知，按 BDEF1 读取", index, other);
                PmxVertexWeight::Bdef1 {
                    bone: self.read_index(bone_size, "bdef1 bone")?,
                }
            }
        };

        let edge_scale = self.read_f32("edge scale")?;

        Ok(PmxVertex {
            position,
            normal,
            uv,
            additional_uvs,
            weight,
            edge_scale,
        })
    }

    fn read_material(&mut self, header: &PmxHeader) -> Result<PmxMaterial> {
        let name = self.read_text("material name")?;
        let name_en = self.read_text("material english name")?;
        let diffuse = self.read_vec4("diffuse")?;
        let specular = self.read_vec3("specular")?;
        let specular_power = self.read_f32("specular power")?;
        let ambient = self.read_vec3("ambient")?;
        let draw_flags = MaterialDrawFlags::from_bits_truncate(self.read_u8("draw flags")?);
        let edge_color = self.read_vec4("edge color")?;
        let edge_size = self.read_f32("edge size")?;
        let texture_index = self.read_index(header.texture_index_size, "texture index")?;
        let sphere_texture_index = self.read_index(header.texture_index_size, "sphere texture index")?;
        let sphere_mode = match self.read_u8("sphere mode")? {
            1 => SphereMode::Multiply,
            2 => SphereMode::Add,
            3 => SphereMode::SubTexture,
            _ => SphereMode::None,
        };
        let toon = match self.read_u8("toon mode")? {
            0 => ToonRef::Texture(self.read_index(header.texture_index_size, "toon texture index")?),
            _ => ToonRef::Shared(self.read_u8("shared toon index")?),
        };
        let memo = self.read_text("material memo")?;
        let index_count = self.read_i32("material index count")?;
        if index_count < 0 {
            return Err(MmdError::PmxParse(format!(
                "Negative index count {} in material '{}'", index_count, name
            )));
        }

        Ok(PmxMaterial {
            name,
            name_en,
            diffuse,
            specular,
            specular_power,
            ambient,
            draw_flags,
            edge_color,
            edge_size,
            texture_index,
            sphere_texture_index,
            sphere_mode,
            toon,
            memo,
            index_count: index_count as u32,
        })
    }

    // ========================================================================
    // 骨骼
    // ========================================================================

    fn read_bone(&mut self, header: &PmxHeader) -> Result<PmxBone> {
        let bone_size = header.bone_index_size;
        let name = self.read_text("bone name")?;
        let name_en = self.read_text("bone english name")?;
        let position = self.read_vec3("bone position")?;
        let parent = self.read_index(bone_size, "parent bone")?;
        let deform_depth = self.read_i32("deform depth")?;
        let flags = PmxBoneFlags::from_bits_truncate(self.read_u16("bone flags")?);

        let tail = if flags.contains(PmxBoneFlags::CONNECTION) {
            BoneTail::Bone(self.read_index(bone_size, "tail bone")?)
        } else {
            BoneTail::Offset(self.read_vec3("tail offset")?)
        };

        let append = if flags.intersects(PmxBoneFlags::APPEND_ROTATE | PmxBoneFlags::APPEND_TRANSLATE) {
            let parent = self.read_index(bone_size, "append parent")?;
            let rate = self.read_f32("append rate")?;
            Some((parent, rate))
        } else {
            None
        };

        let fixed_axis = if flags.contains(PmxBoneFlags::FIXED_AXIS) {
            Some(self.read_vec3("fixed axis")?)
        } else {
            None
        };

        let local_axis = if flags.contains(PmxBoneFlags::LOCAL_AXIS) {
            let x = self.read_vec3("local axis x")?;
            let z = self.read_vec3("local axis z")?;
            Some((x, z))
        } else {
            None
        };

        let external_parent_key = if flags.contains(PmxBoneFlags::EXTERNAL_PARENT) {
            Some(self.read_i32("external parent key")?)
        } else {
            None
        };

        let ik = if flags.contains(PmxBoneFlags::IK) {
            let target = self.read_index(bone_size, "ik target")?;
            let loop_count = self.read_i32("ik loop count")?;
            let limit_angle = self.read_f32("ik limit angle")?;
            let link_count = self.read_count("ik link count")?;
            let mut links = Vec::with_capacity(link_count.min(64));
            for _ in 0..link_count {
                let bone = self.read_index(bone_size, "ik link bone")?;
                let limits = if self.read_u8("ik link limit flag")? != 0 {
                    let lower = self.read_vec3("ik link lower limit")?;
                    let upper = self.read_vec3("ik link upper limit")?;
                    Some((lower, upper))
                } else {
                    None
                };
                links.push(PmxIkLink { bone, limits });
            }
            Some(PmxIk {
                target,
                loop_count,
                limit_angle,
                links,
            })
        } else {
            None
        };

        Ok(PmxBone {
            name,
            name_en,
            position,
            parent,
            deform_depth,
            flags,
            tail,
            append,
            fixed_axis,
            local_axis,
            external_parent_key,
            ik,
        })
    }

    // ========================================================================
    // Morph
    // ========================================================================

    fn read_morph(&mut self, header: &PmxHeader) -> Result<PmxMorph> {
        let name = self.read_text("morph name")?;
        let name_en = self.read_text("morph english name")?;
        let panel = match self.read_u8("morph panel")? {
            0 => MorphPanel::System,
            1 => MorphPanel::Eyebrow,
            2 => MorphPanel::Eye,
            3 => MorphPanel::Mouth,
            _ => MorphPanel::Other,
        };
        let morph_type = self.read_u8("morph type")?;
        let count = self.read_count("morph offset count")?;
        let cap = count.min(1 << 16);

        let offsets = match morph_type {
            0 | 9 => {
                let mut list = Vec::with_capacity(cap);
                for _ in 0..count {
                    list.push(PmxGroupOffset {
                        morph: self.read_index(header.morph_index_size, "group morph index")?,
                        weight: self.read_f32("group morph weight")?,
                    });
                }
                if morph_type == 0 {
                    PmxMorphOffsets::Group(list)
                } else {
                    PmxMorphOffsets::Flip(list)
                }
            }
            1 => {
                let mut list = Vec::with_capacity(cap);
                for _ in 0..count {
                    list.push(PmxVertexOffset {
                        vertex: self.read_vertex_index(header.vertex_index_size, "vertex morph index")? as usize,
                        offset: self.read_vec3("vertex morph offset")?,
                    });
                }
                PmxMorphOffsets::Vertex(list)
            }
            2 => {
                let mut list = Vec::with_capacity(cap);
                for _ in 0..count {
                    list.push(PmxBoneOffset {
                        bone: self.read_index(header.bone_index_size, "bone morph index")?,
                        translation: self.read_vec3("bone morph translation")?,
                        rotation: self.read_vec4("bone morph rotation")?,
                    });
                }
                PmxMorphOffsets::Bone(list)
            }
            3..=7 => {
                let mut list = Vec::with_capacity(cap);
                for _ in 0..count {
                    list.push(PmxUvOffset {
                        vertex: self.read_vertex_index(header.vertex_index_size, "uv morph index")? as usize,
                        offset: self.read_vec4("uv morph offset")?,
                    });
                }
                if morph_type == 3 {
                    PmxMorphOffsets::Uv(list)
                } else {
                    PmxMorphOffsets::AdditionalUv(morph_type - 3, list)
                }
            }
            8 => {
                let mut list = Vec::with_capacity(cap);
                for _ in 0..count {
                    list.push(PmxMaterialOffset {
                        material: self.read_index(header.material_index_size, "material morph index")?,
                        operation: self.read_u8("material morph operation")?,
                        diffuse: self.read_vec4("material morph diffuse")?,
                        specular: self.read_vec3("material morph specular")?,
                        specular_power: self.read_f32("material morph specular power")?,
                        ambient: self.read_vec3("material morph ambient")?,
                        edge_color: self.read_vec4("material morph edge color")?,
                        edge_size: self.read_f32("material morph edge size")?,
                        texture_factor: self.read_vec4("material morph texture factor")?,
                        sphere_texture_factor: self.read_vec4("material morph sphere factor")?,
                        toon_texture_factor: self.read_vec4("material morph toon factor")?,
                    });
                }
                PmxMorphOffsets::Material(list)
            }
            10 => {
                let mut list = Vec::with_capacity(cap);
                for _ in 0..count {
                    list.push(PmxImpulseOffset {
                        rigid_body: self.read_index(header.rigid_body_index_size, "impulse rigid body")?,
                        local: self.read_u8("impulse local flag")? != 0,
                        velocity: self.read_vec3("impulse velocity")?,
                        torque: self.read_vec3("impulse torque")?,
                    });
                }
                PmxMorphOffsets::Impulse(list)
            }
            other => {
                return Err(MmdError::PmxParse(format!(
                    "Invalid morph type {} in morph '{}'", other, name
                )));
            }
        };

        Ok(PmxMorph {
            name,
            name_en,
            panel,
            offsets,
        })
    }

    fn skip_display_frame(&mut self, header: &PmxHeader) -> Result<()> {
        self.read_text("display frame name")?;
        self.read_text("display frame english name")?;
        self.read_u8("display frame flag")?;
        let count = self.read_count("display frame element count")?;
        for _ in 0..count {
            match self.read_u8("display frame element type")? {
                0 => {
                    self.read_index(header.bone_index_size, "display frame bone")?;
                }
                1 => {
                    self.read_index(header.morph_index_size, "display frame morph")?;
                }
                other => {
                    return Err(MmdError::PmxParse(format!("Invalid display frame element type: {}", other)));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // 刚体 / 关节
    // ========================================================================

    fn read_rigid_body(&mut self, header: &PmxHeader) -> Result<PmxRigidBody> {
        let name = self.read_text("rigid body name")?;
        let name_en = self.read_text("rigid body english name")?;
        let bone = self.read_index(header.bone_index_size, "rigid body bone")?;
        let group = self.read_u8("rigid body group")?;
        let collision_mask = self.read_u16("rigid body collision mask")?;
        let shape = match self.read_u8("rigid body shape")? {
            0 => RigidBodyShape::Sphere,
            1 => RigidBodyShape::Box,
            2 => RigidBodyShape::Capsule,
            other => {
                return Err(MmdError::PmxParse(format!("Invalid rigid body shape {} in '{}'", other, name)));
            }
        };
        let size = self.read_vec3("rigid body size")?;
        let position = self.read_vec3("rigid body position")?;
        let rotation = self.read_vec3("rigid body rotation")?;
        let mass = self.read_f32("rigid body mass")?;
        let linear_damping = self.read_f32("rigid body linear damping")?;
        let angular_damping = self.read_f32("rigid body angular damping")?;
        let restitution = self.read_f32("rigid body restitution")?;
        let friction = self.read_f32("rigid body friction")?;
        let mode = match self.read_u8("rigid body mode")? {
            0 => RigidBodyMode::Static,
            1 => RigidBodyMode::Dynamic,
            2 => RigidBodyMode::DynamicWithBonePosition,
            other => {
                return Err(MmdError::PmxParse(format!("Invalid rigid body mode {} in '{}'", other, name)));
            }
        };

        Ok(PmxRigidBody {
            name,
            name_en,
            bone,
            group,
            collision_mask,
            shape,
            size,
            position,
            rotation,
            mass,
            linear_damping,
            angular_damping,
            restitution,
            friction,
            mode,
        })
    }

    fn read_joint(&mut self, header: &PmxHeader) -> Result<PmxJoint> {
        let name = self.read_text("joint name")?;
        let name_en = self.read_text("joint english name")?;
        let joint_type = match self.read_u8("joint type")? {
            0 => JointType::Spring6Dof,
            1 => JointType::SixDof,
            2 => JointType::P2p,
            3 => JointType::ConeTwist,
            4 => JointType::Slider,
            5 => JointType::Hinge,
            other => {
                return Err(MmdError::PmxParse(format!("Invalid joint type {} in '{}'", other, name)));
            }
        };

        Ok(PmxJoint {
            joint_type,
            rigid_body_a: self.read_index(header.rigid_body_index_size, "joint rigid body a")?,
            rigid_body_b: self.read_index(header.rigid_body_index_size, "joint rigid body b")?,
            position: self.read_vec3("joint position")?,
            rotation: self.read_vec3("joint rotation")?,
            linear_lower: self.read_vec3("joint linear lower")?,
            linear_upper: self.read_vec3("joint linear upper")?,
            angular_lower: self.read_vec3("joint angular lower")?,
            angular_upper: self.read_vec3("joint angular upper")?,
            linear_spring: self.read_vec3("joint linear spring")?,
            angular_spring: self.read_vec3("joint angular spring")?,
            name,
            name_en,
        })
    }

    // ========================================================================
    // 基础读取
    // ========================================================================

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        self.cursor.read_u8()
            .map_err(|e| MmdError::PmxParse(format!("Failed to read {}: {}", what, e)))
    }

    fn read_u16(&mut self, what: &str) -> Result<u16> {
        self.cursor.read_u16::<LittleEndian>()
            .map_err(|e| MmdError::PmxParse(format!("Failed to read {}: {}", what, e)))
    }

    fn read_i32(&mut self, what: &str) -> Result<i32> {
        self.cursor.read_i32::<LittleEndian>()
            .map_err(|e| MmdError::PmxParse(format!("Failed to read {}: {}", what, e)))
    }

    fn read_f32(&mut self, what: &str) -> Result<f32> {
        self.cursor.read_f32::<LittleEndian>()
            .map_err(|e| MmdError::PmxParse(format!("Failed to read {}: {}", what, e)))
    }

    fn read_vec2(&mut self, what: &str) -> Result<Vec2> {
        Ok(Vec2::new(self.read_f32(what)?, self.read_f32(what)?))
    }

    fn read_vec3(&mut self, what: &str) -> Result<Vec3> {
        Ok(Vec3::new(self.read_f32(what)?, self.read_f32(what)?, self.read_f32(what)?))
    }

    fn read_vec4(&mut self, what: &str) -> Result<Vec4> {
        Ok(Vec4::new(
            self.read_f32(what)?,
            self.read_f32(what)?,
            self.read_f32(what)?,
            self.read_f32(what)?,
        ))
    }

    /// 读取非负计数
    fn read_count(&mut self, what: &str) -> Result<usize> {
        let count = self.read_i32(what)?;
        if count < 0 {
            return Err(MmdError::PmxParse(format!("Negative {}: {}", what, count)));
        }
        Ok(count as usize)
    }

    /// 有符号索引，负数映射为 None
    fn read_index(&mut self, size: u8, what: &str) -> Result<Option<usize>> {
        let value = match size {
            1 => self.cursor.read_i8().map(i64::from),
            2 => self.cursor.read_i16::<LittleEndian>().map(i64::from),
            _ => self.cursor.read_i32::<LittleEndian>().map(i64::from),
        }
        .map_err(|e| MmdError::PmxParse(format!("Failed to read {}: {}", what, e)))?;

        Ok(if value < 0 { None } else { Some(value as usize) })
    }

    /// 顶点索引（1/2 字节无符号）
    fn read_vertex_index(&mut self, size: u8, what: &str) -> Result<u32> {
        match size {
            1 => self.cursor.read_u8().map(u32::from),
            2 => self.cursor.read_u16::<LittleEndian>().map(u32::from),
            _ => self.cursor.read_u32::<LittleEndian>(),
        }
        .map_err(|e| MmdError::PmxParse(format!("Failed to read {}: {}", what, e)))
    }

    fn read_text(&mut self, what: &str) -> Result<String> {
        let len = self.read_i32(what)?;
        if len < 0 {
            return Err(MmdError::PmxParse(format!("Negative text length for {}: {}", what, len)));
        }
        let remaining = self.cursor.get_ref().len() as u64 - self.cursor.position().min(self.cursor.get_ref().len() as u64);
        if len as u64 > remaining {
            return Err(MmdError::PmxParse(format!(
                "Text length {} for {} exceeds remaining {} bytes", len, what, remaining
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        self.cursor.read_exact(&mut bytes)
            .map_err(|e| MmdError::PmxParse(format!("Failed to read {}: {}", what, e)))?;

        let encoding = self.header.as_ref().map(|h| h.encoding).unwrap_or(TextEncoding::Utf16Le);
        let decoded = match encoding {
            TextEncoding::Utf16Le => encoding_rs::UTF_16LE.decode_without_bom_handling(&bytes).0,
            TextEncoding::Utf8 => encoding_rs::UTF_8.decode_without_bom_handling(&bytes).0,
        };
        Ok(decoded.into_owned())
    }
}
