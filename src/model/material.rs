//! MMD 材质定义

use glam::Vec4;

use crate::morph::MaterialFactor;
use crate::pmx::{MaterialDrawFlags, PmxMaterial, SphereMode, ToonRef};

/// MMD 材质
///
/// `initial` 为文件中的原始参数，`current` 为应用材质 Morph 后的结果。
/// 贴图 / 球面贴图 / Toon 系数不与颜色合并，以乘算与加算两组交给渲染层。
#[derive(Clone, Debug)]
pub struct MmdMaterial {
    pub name: String,
    pub name_en: String,
    pub initial: MaterialFactor,
    pub current: MaterialFactor,

    pub texture_mul_factor: Vec4,
    pub texture_add_factor: Vec4,
    pub sphere_texture_mul_factor: Vec4,
    pub sphere_texture_add_factor: Vec4,
    pub toon_texture_mul_factor: Vec4,
    pub toon_texture_add_factor: Vec4,

    pub texture_index: Option<usize>,
    pub sphere_texture_index: Option<usize>,
    pub sphere_mode: SphereMode,
    pub toon: ToonRef,
    pub draw_flags: MaterialDrawFlags,
}

impl MmdMaterial {
    pub fn from_pmx(pmx: &PmxMaterial) -> Self {
        let initial = MaterialFactor {
            diffuse: pmx.diffuse,
            specular: pmx.specular,
            specular_power: pmx.specular_power,
            ambient: pmx.ambient,
            edge_color: pmx.edge_color,
            edge_size: pmx.edge_size,
            texture_factor: Vec4::ONE,
            sphere_texture_factor: Vec4::ONE,
            toon_texture_factor: Vec4::ONE,
        };
        Self {
            name: pmx.name.clone(),
            name_en: pmx.name_en.clone(),
            initial,
            current: initial,
            texture_mul_factor: Vec4::ONE,
            texture_add_factor: Vec4::ZERO,
            sphere_texture_mul_factor: Vec4::ONE,
            sphere_texture_add_factor: Vec4::ZERO,
            toon_texture_mul_factor: Vec4::ONE,
            toon_texture_add_factor: Vec4::ZERO,
            texture_index: pmx.texture_index,
            sphere_texture_index: pmx.sphere_texture_index,
            sphere_mode: pmx.sphere_mode,
            toon: pmx.toon,
            draw_flags: pmx.draw_flags,
        }
    }

    /// 合并本帧的材质 Morph 结果：最终值 = 初始值 * 乘算 + 加算
    pub fn apply_morph_factors(&mut self, mul: &MaterialFactor, add: &MaterialFactor) {
        let init = &self.initial;
        self.current = MaterialFactor {
            diffuse: init.diffuse * mul.diffuse + add.diffuse,
            specular: init.specular * mul.specular + add.specular,
            specular_power: init.specular_power * mul.specular_power + add.specular_power,
            ambient: init.ambient * mul.ambient + add.ambient,
            edge_color: init.edge_color * mul.edge_color + add.edge_color,
            edge_size: init.edge_size * mul.edge_size + add.edge_size,
            texture_factor: mul.texture_factor + add.texture_factor,
            sphere_texture_factor: mul.sphere_texture_factor + add.sphere_texture_factor,
            toon_texture_factor: mul.toon_texture_factor + add.toon_texture_factor,
        };
        self.texture_mul_factor = mul.texture_factor;
        self.texture_add_factor = add.texture_factor;
        self.sphere_texture_mul_factor = mul.sphere_texture_factor;
        self.sphere_texture_add_factor = add.sphere_texture_factor;
        self.toon_texture_mul_factor = mul.toon_texture_factor;
        self.toon_texture_add_factor = add.toon_texture_factor;
    }

    /// 恢复为文件中的原始参数
    pub fn reset(&mut self) {
        self.apply_morph_factors(&MaterialFactor::ONE, &MaterialFactor::ZERO);
    }

    /// 是否双面渲染
    pub fn is_double_sided(&self) -> bool {
        self.draw_flags.contains(MaterialDrawFlags::NO_CULL)
    }

    /// 是否投射地面阴影
    pub fn casts_shadow(&self) -> bool {
        self.draw_flags.contains(MaterialDrawFlags::GROUND_SHADOW)
    }

    pub fn receives_shadow(&self) -> bool {
        self.draw_flags.contains(MaterialDrawFlags::RECEIVE_SELF_SHADOW)
    }

    /// 是否绘制边缘
    pub fn has_edge(&self) -> bool {
        self.draw_flags.contains(MaterialDrawFlags::EDGE)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use glam::Vec3;

    pub(crate) fn pmx_material(name: &str, index_count: u32) -> PmxMaterial {
        PmxMaterial {
            name: name.to_string(),
            name_en: String::new(),
            diffuse: Vec4::new(0.8, 0.6, 0.4, 1.0),
            specular: Vec3::splat(0.1),
            specular_power: 5.0,
            ambient: Vec3::splat(0.4),
            draw_flags: MaterialDrawFlags::NO_CULL | MaterialDrawFlags::EDGE,
            edge_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            edge_size: 1.0,
            texture_index: Some(0),
            sphere_texture_index: None,
            sphere_mode: SphereMode::None,
            toon: ToonRef::Shared(0),
            memo: String::new(),
            index_count,
        }
    }

    #[test]
    fn test_morph_factors_combine() {
        let mut material = MmdMaterial::from_pmx(&pmx_material("skin", 3));
        let mut mul = MaterialFactor::ONE;
        mul.diffuse = Vec4::new(0.5, 1.0, 1.0, 1.0);
        let mut add = MaterialFactor::ZERO;
        add.edge_size = 0.5;
        add.texture_factor = Vec4::splat(0.25);

        material.apply_morph_factors(&mul, &add);
        assert!(material.current.diffuse.abs_diff_eq(Vec4::new(0.4, 0.6, 0.4, 1.0), 1e-6));
        assert_eq!(material.current.edge_size, 1.5);
        assert_eq!(material.texture_add_factor, Vec4::splat(0.25));
        assert_eq!(material.texture_mul_factor, Vec4::ONE);

        material.reset();
        assert_eq!(material.current, material.initial);
        assert!(material.is_double_sided() && material.has_edge());
    }
}
