//! 分拣决策与文件移动

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use super::grid::{grid_cell, GridCell, GRID_CELLS};
use crate::config::{CollisionPolicy, PersonPick, SortConfig, Variant};
use crate::error::{SortError, SortResult};
use crate::{Detection, DetectionResult};

pub const PERSON_DIR: &str = "person";
pub const NO_PERSON_DIR: &str = "no-person";

/// 图片最终归属的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Grid(GridCell),
    Person,
    NoPerson,
}

impl Bucket {
    pub fn dir_name(&self) -> String {
        match self {
            Bucket::Grid(cell) => cell.dir_name(),
            Bucket::Person => PERSON_DIR.to_string(),
            Bucket::NoPerson => NO_PERSON_DIR.to_string(),
        }
    }

    pub fn has_person(&self) -> bool {
        !matches!(self, Bucket::NoPerson)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

impl Serialize for Bucket {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.dir_name())
    }
}

/// 移动结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved(PathBuf),
    /// 同名冲突且策略为 skip, 原图未动
    Skipped,
}

pub struct Distributor {
    root: PathBuf,
    variant: Variant,
    pick: PersonPick,
    class: String,
    on_collision: CollisionPolicy,
}

impl Distributor {
    pub fn new(config: &SortConfig) -> Self {
        Self {
            root: config.input_dir.clone(),
            variant: config.variant,
            pick: config.pick,
            class: config.class.clone(),
            on_collision: config.on_collision,
        }
    }

    /// 当前分拣方式下的全部类别
    pub fn buckets(&self) -> Vec<Bucket> {
        match self.variant {
            Variant::Binary => vec![Bucket::Person, Bucket::NoPerson],
            Variant::Grid => (0..GRID_CELLS)
                .filter_map(GridCell::from_index)
                .map(Bucket::Grid)
                .chain(std::iter::once(Bucket::NoPerson))
                .collect(),
        }
    }

    pub fn dir_of(&self, bucket: Bucket) -> PathBuf {
        self.root.join(bucket.dir_name())
    }

    /// 创建全部目标目录, 已存在视为成功
    pub fn prepare(&self) -> Result<()> {
        for bucket in self.buckets() {
            let dir = self.dir_of(bucket);
            fs::create_dir_all(&dir)
                .with_context(|| format!("创建目录失败: {}", dir.display()))?;
        }
        Ok(())
    }

    /// 根据检测结果决定类别
    pub fn decide(&self, result: &DetectionResult, width: u32, height: u32) -> SortResult<Bucket> {
        let Some(person) = self.pick_person(result) else {
            return Ok(Bucket::NoPerson);
        };
        match self.variant {
            Variant::Binary => Ok(Bucket::Person),
            Variant::Grid => {
                let cell = grid_cell(person.bbox.cxcy(), width, height)?;
                Ok(Bucket::Grid(cell))
            }
        }
    }

    /// 按策略选出决定网格的人物; 并列时取列表中靠前的
    fn pick_person<'a>(&'a self, result: &'a DetectionResult) -> Option<&'a Detection> {
        let mut persons = result.of_class(&self.class);
        match self.pick {
            PersonPick::First => persons.next(),
            PersonPick::Confident => persons.fold(None, |best: Option<&Detection>, d| match best {
                Some(b) if b.confidence() >= d.confidence() => Some(b),
                _ => Some(d),
            }),
            PersonPick::Largest => persons.fold(None, |best: Option<&Detection>, d| match best {
                Some(b) if b.bbox.area() >= d.bbox.area() => Some(b),
                _ => Some(d),
            }),
        }
    }

    /// 把图片移入类别目录, 保留原文件名
    pub fn dispatch(&self, src: &Path, bucket: Bucket) -> Result<MoveOutcome> {
        let file_name = src
            .file_name()
            .ok_or_else(|| SortError::InvalidPath(src.to_path_buf()))?;
        let dir = self.dir_of(bucket);
        let mut dst = dir.join(file_name);

        if dst.exists() {
            match self.on_collision {
                CollisionPolicy::Fail => return Err(SortError::Collision(dst).into()),
                CollisionPolicy::Skip => {
                    warn!("目标已存在, 跳过: {}", dst.display());
                    return Ok(MoveOutcome::Skipped);
                }
                CollisionPolicy::Overwrite => {
                    debug!("覆盖已有文件: {}", dst.display());
                    fs::remove_file(&dst)
                        .with_context(|| format!("删除已有文件失败: {}", dst.display()))?;
                }
                CollisionPolicy::Rename => {
                    dst = free_name(&dir, Path::new(file_name));
                    debug!("目标已存在, 改名为: {}", dst.display());
                }
            }
        }

        move_file(src, &dst)
            .with_context(|| format!("移动失败: {} → {}", src.display(), dst.display()))?;
        Ok(MoveOutcome::Moved(dst))
    }
}

/// 第一个不存在的 `<stem>_<n>.<ext>`
fn free_name(dir: &Path, file_name: &Path) -> PathBuf {
    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// rename 失败 (如跨文件系统) 时退回到复制后删除
fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !src.is_file() {
                return Err(rename_err);
            }
            fs::copy(src, dst).map_err(|_| rename_err)?;
            fs::remove_file(src)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bbox;

    fn person_at(label: &str, cx: f32, cy: f32, conf: f32) -> Detection {
        Detection::new(label, Bbox::new(cx - 10.0, cy - 10.0, 20.0, 20.0, 0, conf))
    }

    fn distributor(variant: Variant, root: &Path) -> Distributor {
        let config = SortConfig {
            input_dir: root.to_path_buf(),
            variant,
            ..SortConfig::default()
        };
        Distributor::new(&config)
    }

    #[test]
    fn test_binary_mixed_case_person() {
        let d = distributor(Variant::Binary, Path::new("in"));
        let result = DetectionResult::new(vec![
            person_at("car", 50.0, 50.0, 0.9),
            person_at("Person", 300.0, 200.0, 0.4),
        ]);
        assert_eq!(d.decide(&result, 640, 480).unwrap(), Bucket::Person);
    }

    #[test]
    fn test_no_person_goes_to_no_person() {
        let d = distributor(Variant::Grid, Path::new("in"));
        let result = DetectionResult::new(vec![person_at("dog", 50.0, 50.0, 0.9)]);
        assert_eq!(d.decide(&result, 640, 480).unwrap(), Bucket::NoPerson);
        let empty = DetectionResult::default();
        assert_eq!(d.decide(&empty, 640, 480).unwrap(), Bucket::NoPerson);
    }

    #[test]
    fn test_grid_first_person_wins() {
        let d = distributor(Variant::Grid, Path::new("in"));
        // 640x480: 第 3 格 (col 3, row 0), 第 7 格 (col 3, row 1)
        let result = DetectionResult::new(vec![
            person_at("person", 600.0, 60.0, 0.3),
            person_at("person", 600.0, 180.0, 0.9),
        ]);
        let bucket = d.decide(&result, 640, 480).unwrap();
        assert_eq!(bucket, Bucket::Grid(GridCell::from_index(3).unwrap()));
        assert_eq!(bucket.dir_name(), "grid_03");
    }

    #[test]
    fn test_grid_confident_and_largest_picks() {
        let root = Path::new("in");
        let result = DetectionResult::new(vec![
            person_at("person", 600.0, 60.0, 0.3),
            person_at("person", 600.0, 180.0, 0.9),
            Detection::new("person", Bbox::new(0.0, 400.0, 100.0, 80.0, 0, 0.5)),
        ]);
        let config = SortConfig {
            input_dir: root.to_path_buf(),
            pick: PersonPick::Confident,
            ..SortConfig::default()
        };
        let bucket = Distributor::new(&config).decide(&result, 640, 480).unwrap();
        assert_eq!(bucket.dir_name(), "grid_07");

        let config = SortConfig {
            pick: PersonPick::Largest,
            ..config
        };
        let bucket = Distributor::new(&config).decide(&result, 640, 480).unwrap();
        assert_eq!(bucket.dir_name(), "grid_12");
    }

    #[test]
    fn test_bucket_dirs_per_variant() {
        let grid = distributor(Variant::Grid, Path::new("in")).buckets();
        assert_eq!(grid.len(), 17);
        assert_eq!(grid[0].dir_name(), "grid_00");
        assert_eq!(grid[15].dir_name(), "grid_15");
        assert_eq!(grid[16], Bucket::NoPerson);

        let binary = distributor(Variant::Binary, Path::new("in")).buckets();
        let names: Vec<_> = binary.iter().map(|b| b.dir_name()).collect();
        assert_eq!(names, vec!["person", "no-person"]);
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let d = distributor(Variant::Grid, dir.path());
        d.prepare().unwrap();
        d.prepare().unwrap();
        assert!(dir.path().join("grid_00").is_dir());
        assert!(dir.path().join("grid_15").is_dir());
        assert!(dir.path().join("no-person").is_dir());
    }

    fn collision_setup(policy: CollisionPolicy) -> (tempfile::TempDir, Distributor, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let config = SortConfig {
            input_dir: dir.path().to_path_buf(),
            variant: Variant::Binary,
            on_collision: policy,
            ..SortConfig::default()
        };
        let d = Distributor::new(&config);
        d.prepare().unwrap();
        let src = dir.path().join("a.jpg");
        fs::write(&src, b"new").unwrap();
        fs::write(dir.path().join("person").join("a.jpg"), b"old").unwrap();
        (dir, d, src)
    }

    #[test]
    fn test_dispatch_moves_with_basename() {
        let dir = tempfile::tempdir().unwrap();
        let d = distributor(Variant::Binary, dir.path());
        d.prepare().unwrap();
        let src = dir.path().join("b.png");
        fs::write(&src, b"img").unwrap();

        let outcome = d.dispatch(&src, Bucket::NoPerson).unwrap();
        let dst = dir.path().join("no-person").join("b.png");
        assert_eq!(outcome, MoveOutcome::Moved(dst.clone()));
        assert!(!src.exists());
        assert_eq!(fs::read(dst).unwrap(), b"img");
    }

    #[test]
    fn test_collision_fail() {
        let (dir, d, src) = collision_setup(CollisionPolicy::Fail);
        let err = d.dispatch(&src, Bucket::Person).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SortError>(),
            Some(SortError::Collision(_))
        ));
        assert!(src.exists());
        assert_eq!(fs::read(dir.path().join("person/a.jpg")).unwrap(), b"old");
    }

    #[test]
    fn test_collision_overwrite() {
        let (dir, d, src) = collision_setup(CollisionPolicy::Overwrite);
        d.dispatch(&src, Bucket::Person).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(dir.path().join("person/a.jpg")).unwrap(), b"new");
    }

    #[test]
    fn test_collision_rename() {
        let (dir, d, src) = collision_setup(CollisionPolicy::Rename);
        fs::write(dir.path().join("person/a_1.jpg"), b"older").unwrap();
        let outcome = d.dispatch(&src, Bucket::Person).unwrap();
        assert_eq!(
            outcome,
            MoveOutcome::Moved(dir.path().join("person").join("a_2.jpg"))
        );
        assert_eq!(fs::read(dir.path().join("person/a.jpg")).unwrap(), b"old");
    }

    #[test]
    fn test_collision_skip() {
        let (_dir, d, src) = collision_setup(CollisionPolicy::Skip);
        assert_eq!(d.dispatch(&src, Bucket::Person).unwrap(), MoveOutcome::Skipped);
        assert!(src.exists());
    }
}
