//! MMD 运行时模型
//!
//! - `loader`: PmxModel → MmdModel（坐标转换与作者数据修复）
//! - `runtime`: 每帧动画流程
//! - `material` / `submesh`: 渲染层使用的材质与子网格

pub(crate) mod loader;
pub(crate) mod material;
mod runtime;
mod submesh;

pub use loader::{build_model, load_pmx};
pub use material::MmdMaterial;
pub use runtime::MmdModel;
pub use submesh::SubMesh;

pub use crate::skinning::{RuntimeVertex, VertexWeight};
