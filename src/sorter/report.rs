//! 分布统计与报告

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use super::distribute::Bucket;
use crate::config::Variant;
use crate::gen_time_string;

pub const REPORT_FILE: &str = "distribution_result.txt";
pub const REPORT_JSON_FILE: &str = "distribution_result.json";

/// 每个类别的计数, 每张图片只计一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    variant: Variant,
    counts: BTreeMap<Bucket, usize>,
    skipped: usize,
}

#[derive(Serialize)]
struct DistributionJson<'a> {
    generated_at: String,
    variant: Variant,
    buckets: &'a BTreeMap<Bucket, usize>,
    total: usize,
    person: usize,
    no_person: usize,
    skipped: usize,
}

impl Distribution {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            counts: BTreeMap::new(),
            skipped: 0,
        }
    }

    pub fn record(&mut self, bucket: Bucket) {
        *self.counts.entry(bucket).or_insert(0) += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    pub fn count(&self, bucket: Bucket) -> usize {
        self.counts.get(&bucket).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn person(&self) -> usize {
        self.counts
            .iter()
            .filter(|(bucket, _)| bucket.has_person())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn no_person(&self) -> usize {
        self.count(Bucket::NoPerson)
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// 可读报告
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "人物検出 分布結果 ({})", gen_time_string());
        let _ = writeln!(out, "{}", "=".repeat(40));
        match self.variant {
            Variant::Grid => {
                for (bucket, n) in &self.counts {
                    if let Bucket::Grid(cell) = bucket {
                        let _ = writeln!(
                            out,
                            "{} (位置: {}, {}): {}枚",
                            cell.dir_name(),
                            cell.column,
                            cell.row,
                            n
                        );
                    }
                }
            }
            Variant::Binary => {
                let _ = writeln!(out, "{}: {}枚", Bucket::Person, self.count(Bucket::Person));
            }
        }
        let _ = writeln!(out, "{}: {}枚", Bucket::NoPerson, self.no_person());
        let _ = writeln!(out, "{}", "-".repeat(40));
        let _ = writeln!(out, "総画像数: {}枚", self.total());
        let _ = writeln!(out, "人物あり: {}枚", self.person());
        let _ = writeln!(out, "人物なし: {}枚", self.no_person());
        if self.skipped > 0 {
            let _ = writeln!(out, "スキップ (同名ファイル): {}枚", self.skipped);
        }
        out
    }

    /// 写出 txt 与 json 报告, 返回 txt 路径
    pub fn write(&self, results_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(results_dir)
            .with_context(|| format!("创建结果目录失败: {}", results_dir.display()))?;

        let txt = results_dir.join(REPORT_FILE);
        fs::write(&txt, self.render())
            .with_context(|| format!("写入报告失败: {}", txt.display()))?;

        let json = DistributionJson {
            generated_at: gen_time_string(),
            variant: self.variant,
            buckets: &self.counts,
            total: self.total(),
            person: self.person(),
            no_person: self.no_person(),
            skipped: self.skipped,
        };
        let path = results_dir.join(REPORT_JSON_FILE);
        fs::write(&path, serde_json::to_string_pretty(&json)?)
            .with_context(|| format!("写入报告失败: {}", path.display()))?;

        Ok(txt)
    }

    /// 控制台输出
    pub fn print(&self) {
        println!("\n{}", self.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorter::grid::GridCell;

    fn cell(i: usize) -> Bucket {
        Bucket::Grid(GridCell::from_index(i).unwrap())
    }

    #[test]
    fn test_grid_report_lists_only_nonzero_cells() {
        let mut d = Distribution::new(Variant::Grid);
        d.record(cell(0));
        d.record(cell(6));
        d.record(cell(6));
        d.record(Bucket::NoPerson);

        let text = d.render();
        assert!(text.contains("grid_00 (位置: 0, 0): 1枚"));
        assert!(text.contains("grid_06 (位置: 2, 1): 2枚"));
        assert!(!text.contains("grid_01"));
        assert!(text.contains("no-person: 1枚"));
        assert!(text.contains("総画像数: 4枚"));
        assert!(text.contains("人物あり: 3枚"));
        assert!(text.contains("人物なし: 1枚"));

        // 行按网格编号排序
        assert!(text.find("grid_00").unwrap() < text.find("grid_06").unwrap());
    }

    #[test]
    fn test_binary_report() {
        let mut d = Distribution::new(Variant::Binary);
        d.record(Bucket::Person);
        d.record_skipped();
        let text = d.render();
        assert!(text.contains("person: 1枚"));
        assert!(text.contains("no-person: 0枚"));
        assert!(text.contains("スキップ (同名ファイル): 1枚"));
        assert_eq!(d.total(), 1);
    }

    #[test]
    fn test_empty_run_report() {
        let d = Distribution::new(Variant::Grid);
        let text = d.render();
        assert!(text.contains("総画像数: 0枚"));
        assert!(!text.contains("grid_"));
    }

    #[test]
    fn test_write_txt_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = Distribution::new(Variant::Grid);
        d.record(cell(15));
        let txt = d.write(&dir.path().join("results")).unwrap();
        assert!(fs::read_to_string(txt).unwrap().contains("grid_15 (位置: 3, 3): 1枚"));

        let json: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("results").join(REPORT_JSON_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(json["variant"], "grid");
        assert_eq!(json["buckets"]["grid_15"], 1);
        assert_eq!(json["total"], 1);
        assert_eq!(json["person"], 1);
    }
}
