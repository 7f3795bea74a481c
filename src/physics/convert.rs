//! 坐标系转换
//!
//! PMX / VMD 数据使用左手坐标系，运行时使用右手坐标系（Z 轴翻转）。
//! 物理世界与动画共用右手坐标系；两侧之间只有 glam 与 nalgebra 的类型转换。

use glam::{Mat4, Quat, Vec3};
use rapier3d::na::{Isometry3, Quaternion, Translation3, UnitQuaternion};

/// InvZ 变换：`S * m * S`，S = scale(1, 1, -1)
///
/// 直接对恰有一个下标为 2 的元素取反，结果按位精确，两次调用还原原矩阵。
pub fn inv_z(m: Mat4) -> Mat4 {
    let mut cols = m.to_cols_array_2d();
    for (c, col) in cols.iter_mut().enumerate() {
        for (r, value) in col.iter_mut().enumerate() {
            if (c == 2) != (r == 2) {
                *value = -*value;
            }
        }
    }
    Mat4::from_cols_array_2d(&cols)
}

/// 左手 → 右手：位置
#[inline]
pub fn flip_position(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.y, -v.z)
}

/// 左手 → 右手：四元数
#[inline]
pub fn flip_rotation(q: Quat) -> Quat {
    Quat::from_xyzw(q.x, q.y, -q.z, -q.w)
}

/// 由 PMX 刚体参数（文件原值）计算右手坐标系下的世界矩阵
///
/// 旋转顺序 Y * X * Z。
pub fn rigid_body_matrix(position: Vec3, rotation: Vec3) -> Mat4 {
    let rot = Quat::from_rotation_y(rotation.y)
        * Quat::from_rotation_x(rotation.x)
        * Quat::from_rotation_z(rotation.z);
    inv_z(Mat4::from_rotation_translation(rot, position))
}

/// 由 PMX 关节参数（文件原值）计算右手坐标系下的世界矩阵
///
/// 旋转顺序 Z * Y * X。
pub fn joint_matrix(position: Vec3, rotation: Vec3) -> Mat4 {
    let rot = Quat::from_rotation_z(rotation.z)
        * Quat::from_rotation_y(rotation.y)
        * Quat::from_rotation_x(rotation.x);
    inv_z(Mat4::from_rotation_translation(rot, position))
}

/// 求逆矩阵，奇异或非有限时退化为单位矩阵
pub fn safe_inverse(m: Mat4) -> Mat4 {
    let det = m.determinant();
    if det.abs() > 1e-12 && det.is_finite() {
        m.inverse()
    } else {
        Mat4::IDENTITY
    }
}

/// glam Mat4 → rapier Isometry（忽略缩放）
pub fn mat4_to_isometry(mat: Mat4) -> Isometry3<f32> {
    let (_, rotation, translation) = mat.to_scale_rotation_translation();
    Isometry3::from_parts(
        Translation3::new(translation.x, translation.y, translation.z),
        UnitQuaternion::from_quaternion(Quaternion::new(rotation.w, rotation.x, rotation.y, rotation.z)),
    )
}

/// rapier Isometry → glam Mat4
pub fn isometry_to_mat4(iso: &Isometry3<f32>) -> Mat4 {
    let t = iso.translation.vector;
    let q = iso.rotation;
    Mat4::from_rotation_translation(
        Quat::from_xyzw(q.i, q.j, q.k, q.w),
        Vec3::new(t.x, t.y, t.z),
    )
}
