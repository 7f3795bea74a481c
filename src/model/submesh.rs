//! 子网格定义

/// 子网格：索引缓冲区中属于同一材质的连续区间
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubMesh {
    pub begin_index: u32,
    pub index_count: u32,
    pub material_index: usize,
}

impl SubMesh {
    pub fn new(begin_index: u32, index_count: u32, material_index: usize) -> Self {
        Self { begin_index, index_count, material_index }
    }

    /// 结束位置（不含）
    pub fn end_index(&self) -> u32 {
        self.begin_index + self.index_count
    }
}
