//! 4x4 网格划分
//!
//! 画面按行优先均分为 16 格, 编号 = row * 4 + column

use std::fmt;

use crate::error::{SortError, SortResult};
use crate::Point2;

pub const GRID_SIZE: u32 = 4;
pub const GRID_CELLS: usize = (GRID_SIZE * GRID_SIZE) as usize;

/// 网格单元, 排序与编号一致 (先行后列)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GridCell {
    pub row: u32,
    pub column: u32,
}

impl GridCell {
    pub fn from_index(index: usize) -> Option<Self> {
        if index >= GRID_CELLS {
            return None;
        }
        Some(Self {
            column: index as u32 % GRID_SIZE,
            row: index as u32 / GRID_SIZE,
        })
    }

    pub fn index(&self) -> usize {
        (self.row * GRID_SIZE + self.column) as usize
    }

    /// 目录名: grid_00 .. grid_15
    pub fn dir_name(&self) -> String {
        format!("grid_{:02}", self.index())
    }
}

impl fmt::Display for GridCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// 中心点所在网格; 右/下边界上的点归入最后一列/行
pub fn grid_cell(center: Point2, width: u32, height: u32) -> SortResult<GridCell> {
    if width == 0 || height == 0 {
        return Err(SortError::EmptyFrame { width, height });
    }
    let grid_width = width as f32 / GRID_SIZE as f32;
    let grid_height = height as f32 / GRID_SIZE as f32;

    let column = ((center.x().max(0.0) / grid_width).floor() as u32).min(GRID_SIZE - 1);
    let row = ((center.y().max(0.0) / grid_height).floor() as u32).min(GRID_SIZE - 1);
    Ok(GridCell { column, row })
}

/// 网格编号 0..=15
pub fn grid_index(center_x: f32, center_y: f32, width: u32, height: u32) -> SortResult<usize> {
    grid_cell(Point2::new(center_x, center_y), width, height).map(|cell| cell.index())
}
