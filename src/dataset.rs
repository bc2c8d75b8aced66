//! TruthfulQA dataset loading
//!
//! Reads the benchmark CSV into in-memory records and turns the
//! semicolon-separated reference answer strings into answer lists.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Upstream location of the benchmark file
pub const TRUTHFULQA_URL: &str =
    "https://raw.githubusercontent.com/sylinrl/TruthfulQA/main/TruthfulQA.csv";

/// File name the benchmark is stored under inside the data directory
pub const TRUTHFULQA_FILE: &str = "TruthfulQA.csv";

/// One benchmark question with its raw reference answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRecord {
    #[serde(rename = "Question")]
    pub question: String,
    #[serde(rename = "Best Answer")]
    pub answer_best: String,
    #[serde(rename = "Correct Answers")]
    pub answer_true: String,
    #[serde(rename = "Incorrect Answers")]
    pub answer_false: String,
}

/// How a reference answer string is cut into individual answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerFormat {
    /// Separator between answers
    pub separator: char,
    /// Append a period to answers that lack one
    pub close: bool,
    /// Discard the piece after the last separator
    pub drop_last: bool,
}

impl AnswerFormat {
    /// TruthfulQA layout: `;`-separated, closed with a period
    pub fn truthfulqa() -> Self {
        Self {
            separator: ';',
            close: true,
            drop_last: false,
        }
    }

    /// Factual-recall layout: `,`-separated with a trailing separator, left as-is
    pub fn factual() -> Self {
        Self {
            separator: ',',
            close: false,
            drop_last: true,
        }
    }
}

impl Default for AnswerFormat {
    fn default() -> Self {
        Self::truthfulqa()
    }
}

/// Split a string of reference answers into formatted answers
pub fn split_multi_answer(ans: &str, format: AnswerFormat) -> Vec<String> {
    let mut pieces: Vec<&str> = ans.trim().split(format.separator).collect();
    if format.drop_last {
        pieces.pop();
    }

    pieces
        .into_iter()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| close_answer(a, format.close))
        .collect()
}

/// Format the best answer to match the reference answers
pub fn format_best(best: &str, close: bool) -> Result<String> {
    let best = best.trim();
    anyhow::ensure!(!best.is_empty(), "Best answer is empty");
    Ok(close_answer(best, close))
}

fn close_answer(answer: &str, close: bool) -> String {
    if close && !answer.ends_with('.') {
        format!("{answer}.")
    } else {
        answer.to_string()
    }
}

/// Static partition of the dataset across independent processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub total: usize,
    pub id: usize,
}

/// Benchmark questions in file order
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    records: Vec<QuestionRecord>,
}

impl Dataset {
    /// Build a dataset from already-parsed records
    pub fn from_records(records: Vec<QuestionRecord>) -> Self {
        Self { records }
    }

    /// Load records from a CSV file with a header row
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open dataset {}", path.display()))?;
        Self::from_reader(file)
    }

    /// Load records from any CSV source
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(reader);

        let headers = reader.headers()?.clone();
        for column in ["Question", "Best Answer", "Correct Answers", "Incorrect Answers"] {
            anyhow::ensure!(
                headers.iter().any(|h| h == column),
                "Dataset is missing required column '{column}'"
            );
        }

        let mut records = Vec::new();
        for (row, record) in reader.deserialize().enumerate() {
            let record: QuestionRecord =
                record.with_context(|| format!("Failed to parse CSV row {}", row + 1))?;
            records.push(record);
        }

        Ok(Self { records })
    }

    /// Return the path of the benchmark file in `dir`, downloading it first if absent
    pub fn ensure_downloaded(dir: &Path) -> Result<PathBuf> {
        let path = dir.join(TRUTHFULQA_FILE);
        if path.exists() {
            info!("File {} exists, use existing file.", TRUTHFULQA_FILE);
            return Ok(path);
        }

        info!("Downloading {}", TRUTHFULQA_URL);
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let body = reqwest::blocking::get(TRUTHFULQA_URL)
            .and_then(reqwest::blocking::Response::error_for_status)
            .context("Failed to download TruthfulQA.csv")?
            .bytes()
            .context("Failed to read download body")?;
        std::fs::write(&path, &body)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(path)
    }

    /// Keep only the first `n` questions
    pub fn truncate(&mut self, n: usize) {
        self.records.truncate(n);
    }

    /// Keep the questions belonging to one shard.
    ///
    /// Every shard gets `len / total` questions; the remainder is not assigned.
    pub fn shard(&mut self, shard: Shard) -> Result<()> {
        anyhow::ensure!(shard.total > 0, "Shard count must be positive");
        anyhow::ensure!(
            shard.id < shard.total,
            "Shard id {} out of range (total={})",
            shard.id,
            shard.total
        );

        let chunk = self.records.len() / shard.total;
        let start = shard.id * chunk;
        self.records = self.records[start..start + chunk].to_vec();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[QuestionRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(q: &str) -> QuestionRecord {
        QuestionRecord {
            question: q.into(),
            answer_best: "b".into(),
            answer_true: "t".into(),
            answer_false: "f".into(),
        }
    }

    #[test]
    fn test_split_truthfulqa() {
        let answers = split_multi_answer(
            " Nothing happens; You digest them.;  ; It passes through ",
            AnswerFormat::truthfulqa(),
        );
        assert_eq!(
            answers,
            vec!["Nothing happens.", "You digest them.", "It passes through."]
        );
    }

    #[test]
    fn test_split_factual_drops_trailing_piece() {
        let answers = split_multi_answer("Paris, Lyon, Nice", AnswerFormat::factual());
        assert_eq!(answers, vec!["Paris", "Lyon"]);

        let answers = split_multi_answer("Paris, Lyon,", AnswerFormat::factual());
        assert_eq!(answers, vec!["Paris", "Lyon"]);
    }

    #[test]
    fn test_format_best() {
        assert_eq!(format_best("  The sky is blue ", true).unwrap(), "The sky is blue.");
        assert_eq!(format_best("Done.", true).unwrap(), "Done.");
        assert_eq!(format_best("Open", false).unwrap(), "Open");
        assert!(format_best("   ", true).is_err());
    }

    #[test]
    fn test_shard_drops_remainder() {
        let mut dataset = Dataset::from_records((0..10).map(|i| record(&i.to_string())).collect());
        dataset.shard(Shard { total: 3, id: 2 }).unwrap();

        let questions: Vec<&str> = dataset.records().iter().map(|r| r.question.as_str()).collect();
        assert_eq!(questions, vec!["6", "7", "8"]);
    }

    #[test]
    fn test_shard_rejects_bad_id() {
        let mut dataset = Dataset::from_records(vec![record("a")]);
        assert!(dataset.shard(Shard { total: 2, id: 2 }).is_err());
        assert!(dataset.shard(Shard { total: 0, id: 0 }).is_err());
    }

    #[test]
    fn test_missing_column() {
        let csv = "Question,Best Answer,Correct Answers\nq,b,t\n";
        let err = Dataset::from_reader(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Incorrect Answers"));
    }
}
