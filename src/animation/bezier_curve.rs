//! 贝塞尔曲线
//!
//! 用于 VMD 动画的非线性插值。端点固定为 (0,0) 和 (1,1)，
//! 由两个控制点决定缓动形状。

use glam::Vec2;

/// 曲线 trait
pub trait Curve {
    fn value(&self, v: f32) -> f32;
}

/// 二分查找容差
const FIND_EPSILON: f32 = 1.0e-5;
/// 二分查找迭代上限
const FIND_MAX_ITERATIONS: u32 = 64;

/// VMD 三次贝塞尔曲线
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VmdBezier {
    /// 控制点1
    pub c0: Vec2,
    /// 控制点2
    pub c1: Vec2,
}

impl Default for VmdBezier {
    /// VMD 默认的线性插值参数 (20,20)-(107,107)
    fn default() -> Self {
        Self::from_parameters([20, 20, 107, 107])
    }
}

impl VmdBezier {
    pub fn new(c0: Vec2, c1: Vec2) -> Self {
        Self { c0, c1 }
    }

    /// 从 VMD 参数创建贝塞尔曲线
    ///
    /// VMD 使用 [0, 127] 范围的控制点参数：x1, y1, x2, y2
    pub fn from_parameters(parameters: [u8; 4]) -> Self {
        Self {
            c0: Vec2::new(parameters[0] as f32 / 127.0, parameters[1] as f32 / 127.0),
            c1: Vec2::new(parameters[2] as f32 / 127.0, parameters[3] as f32 / 127.0),
        }
    }

    /// 导出为 VMD 参数格式
    pub fn to_parameters(&self) -> [u8; 4] {
        let q = |v: f32| (v * 127.0).round().clamp(0.0, 127.0) as u8;
        [q(self.c0.x), q(self.c0.y), q(self.c1.x), q(self.c1.y)]
    }

    /// B(t) 的 x 分量
    #[inline]
    pub fn eval_x(&self, t: f32) -> f32 {
        Self::cubic(self.c0.x, self.c1.x, t)
    }

    /// B(t) 的 y 分量
    #[inline]
    pub fn eval_y(&self, t: f32) -> f32 {
        Self::cubic(self.c0.y, self.c1.y, t)
    }

    /// B(t)
    #[inline]
    pub fn eval(&self, t: f32) -> Vec2 {
        Vec2::new(self.eval_x(t), self.eval_y(t))
    }

    /// P0 = 0, P3 = 1 的三次贝塞尔：3(1-t)²t·p1 + 3(1-t)t²·p2 + t³
    #[inline]
    fn cubic(p1: f32, p2: f32, t: f32) -> f32 {
        let it = 1.0 - t;
        3.0 * it * it * t * p1 + 3.0 * it * t * t * p2 + t * t * t
    }

    /// 求参数 t 使 eval_x(t) = x（二分法）
    ///
    /// x 在 [0,1] 内单调时满足 |eval_x(t) - x| < 1e-5。
    pub fn find_bezier_x(&self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        let mut start = 0.0_f32;
        let mut stop = 1.0_f32;
        let mut t = 0.5_f32;
        let mut current = self.eval_x(t);

        let mut iteration = 0;
        while (current - x).abs() > FIND_EPSILON && iteration < FIND_MAX_ITERATIONS {
            if x < current {
                stop = t;
            } else {
                start = t;
            }
            t = (start + stop) * 0.5;
            current = self.eval_x(t);
            iteration += 1;
        }
        t
    }
}

impl Curve for VmdBezier {
    /// 时间比例 x → 插值进度 y
    fn value(&self, v: f32) -> f32 {
        self.eval_y(self.find_bezier_x(v))
    }
}
