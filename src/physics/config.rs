//! MMD 物理配置
//!
//! 所有参数扁平化，直接在代码中修改默认值即可。

use once_cell::sync::Lazy;
use std::sync::RwLock;

/// 物理配置（扁平化，不嵌套）
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsConfig {
    // ========== 重力 ==========
    /// 重力 Y 分量（负数向下），默认 -98.0（MMD 标准）
    pub gravity_y: f32,

    // ========== 模拟参数 ==========
    /// 物理 FPS，默认 60.0
    pub physics_fps: f32,
    /// 每帧最大子步数，默认 5
    pub max_substep_count: u32,
    /// 求解器迭代次数，默认 8
    pub solver_iterations: usize,
    /// 内部 PGS 迭代次数，默认 2
    pub pgs_iterations: usize,

    // ========== 刚体 ==========
    /// 线性阻尼缩放（乘以 PMX 原值），默认 1.0
    pub linear_damping_scale: f32,
    /// 角速度阻尼缩放（乘以 PMX 原值），默认 1.0
    pub angular_damping_scale: f32,
    /// 质量缩放（乘以 PMX 原值），默认 1.0
    pub mass_scale: f32,

    // ========== 6DOF 弹簧 ==========
    /// 弹簧刚度缩放因子（乘以 PMX 原值），默认 1.0
    pub spring_stiffness_scale: f32,
    /// 弹簧阻尼 = sqrt(刚度 * 系数)，默认 0.5
    pub spring_damping_factor: f32,

    // ========== 速度限制 ==========
    pub max_linear_velocity: f32,
    pub max_angular_velocity: f32,

    // ========== 开关 ==========
    /// 是否启用关节，默认 true
    pub joints_enabled: bool,
    /// 是否创建地面碰撞体，默认 true
    pub ground_enabled: bool,

    // ========== 物理同步 / 重置 ==========
    /// 切换动画时的过渡子帧数，默认 30
    pub sync_frame_count: u32,
    /// 过渡时每个子帧的物理步长（秒），默认 1/30
    pub sync_step: f32,
    /// 重置物理时的单步步长（秒），默认 1/60
    pub reset_step: f32,

    // ========== 调试 ==========
    /// 是否输出调试日志，默认 false
    pub debug_log: bool,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            // MMD 标准重力，PMX 模型的弹簧/质量/阻尼参数都是为此重力设计的
            gravity_y: -98.0,

            physics_fps: 60.0,
            max_substep_count: 5,
            solver_iterations: 8,
            pgs_iterations: 2,

            linear_damping_scale: 1.0,
            angular_damping_scale: 1.0,
            mass_scale: 1.0,

            spring_stiffness_scale: 1.0,
            spring_damping_factor: 0.5,

            // 适配 -98 重力下的速度范围
            max_linear_velocity: 100.0,
            max_angular_velocity: 50.0,

            joints_enabled: true,
            ground_enabled: true,

            sync_frame_count: 30,
            sync_step: 1.0 / 30.0,
            reset_step: 1.0 / 60.0,

            debug_log: false,
        }
    }
}

impl PhysicsConfig {
    /// 固定时间步长
    #[inline]
    pub fn fixed_time_step(&self) -> f32 {
        1.0 / self.physics_fps.max(1.0)
    }
}

/// 全局配置实例
static PHYSICS_CONFIG: Lazy<RwLock<PhysicsConfig>> = Lazy::new(|| {
    RwLock::new(PhysicsConfig::default())
});

/// 获取当前配置（只读）
pub fn get_config() -> PhysicsConfig {
    PHYSICS_CONFIG.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// 手动设置配置（用于运行时调试）
pub fn set_config(config: PhysicsConfig) {
    *PHYSICS_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = config;
}

/// 重置为默认配置
pub fn reset_config() {
    *PHYSICS_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = PhysicsConfig::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PhysicsConfig::default();
        assert_eq!(config.gravity_y, -98.0);
        assert_eq!(config.max_substep_count, 5);
        assert!((config.fixed_time_step() - 1.0 / 60.0).abs() < 1e-7);
    }

    #[test]
    fn test_fixed_step_never_divides_by_zero() {
        let config = PhysicsConfig { physics_fps: 0.0, ..PhysicsConfig::default() };
        assert_eq!(config.fixed_time_step(), 1.0);
    }
}
