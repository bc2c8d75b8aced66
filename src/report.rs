//! Result files and console summary

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::evaluate::EvalResults;

/// Metric rows of the results table, in order
const METRICS: [&str; 3] = ["total_mc1", "total_mc2", "total_mc3"];

/// Paths written for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub table: PathBuf,
    pub details: PathBuf,
}

impl ReportPaths {
    /// `{stem}_{mode}.csv` and `{stem}_{mode}.json`
    pub fn for_stem(stem: &str, mode_suffix: &str) -> Self {
        Self {
            table: PathBuf::from(format!("{stem}_{mode_suffix}.csv")),
            details: PathBuf::from(format!("{stem}_{mode_suffix}.json")),
        }
    }
}

/// Write the averaged table (layers as columns) to CSV
pub fn write_table(results: &EvalResults, path: &Path) -> Result<()> {
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec!["metric".to_string()];
    header.extend(results.layers.iter().map(|(key, _)| key.clone()));
    writer.write_record(&header)?;

    for metric in METRICS {
        let mut row = vec![metric.to_string()];
        row.extend(results.layers.iter().map(|(_, totals)| {
            let value = match metric {
                "total_mc1" => totals.total_mc1,
                "total_mc2" => totals.total_mc2,
                _ => totals.total_mc3,
            };
            value.to_string()
        }));
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

/// Write the full results, per-question scores included, as JSON
pub fn write_details(results: &EvalResults, path: &Path) -> Result<()> {
    create_parent(path)?;
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write both files for a run
pub fn write_report(results: &EvalResults, stem: &str) -> Result<ReportPaths> {
    let paths = ReportPaths::for_stem(stem, &results.mode);
    write_table(results, &paths.table)?;
    write_details(results, &paths.details)?;
    info!("Results saved to {}", paths.table.display());
    info!("Per-question scores saved to {}", paths.details.display());
    Ok(paths)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Print the averaged scores per slot
pub fn print_summary(results: &EvalResults) {
    println!("=== TruthfulQA MC ({} questions) ===", results.n_questions);
    for (key, totals) in &results.layers {
        println!(
            "{:>22}  MC1 {:.4}  MC2 {:.4}  MC3 {:.4}",
            key, totals.total_mc1, totals.total_mc2, totals.total_mc3
        );
    }
    if results.layers.len() > 1 {
        if let Some((key, totals)) = results.best_layer() {
            println!("\nBest MC2: {} ({:.4})", key, totals.total_mc2);
        }
    }
}
