//! Evaluation loop for TruthfulQA multiple choice
//!
//! Scores every true and false reference answer of every question, computes
//! MC1/MC2/MC3 per score slot and averages over the questions evaluated.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use crate::dataset::{format_best, split_multi_answer, AnswerFormat, Dataset, QuestionRecord, Shard};
use crate::metrics::{mc_calcs, McScores};
use crate::model::{AnswerScorer, ScoreMode};
use crate::prompt::build_prompt_and_answer;

/// Number of questions kept in debug mode
pub const DEBUG_QUESTIONS: usize = 10;

/// Configuration for one evaluation run
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Directory holding (or receiving) TruthfulQA.csv
    pub data_path: PathBuf,
    /// Output stem; mode suffix and extension are appended
    pub output_path: String,
    pub mode: ScoreMode,
    /// Evaluate only the first questions
    pub debug: bool,
    pub shard: Option<Shard>,
    pub answer_format: AnswerFormat,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./tfqa"),
            output_path: "./tfqa_result".to_string(),
            mode: ScoreMode::Baseline,
            debug: false,
            shard: None,
            answer_format: AnswerFormat::truthfulqa(),
        }
    }
}

/// Accumulated (and, after averaging, mean) metrics for one score slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LayerTotals {
    pub total_mc1: f64,
    pub total_mc2: f64,
    pub total_mc3: f64,
}

impl LayerTotals {
    fn add(&mut self, scores: &McScores) {
        self.total_mc1 += scores.mc1;
        self.total_mc2 += scores.mc2;
        self.total_mc3 += scores.mc3;
    }

    fn divide(&mut self, n: f64) {
        self.total_mc1 /= n;
        self.total_mc2 /= n;
        self.total_mc3 /= n;
    }
}

/// Per-question outcome, one `McScores` per score slot
#[derive(Debug, Clone, Serialize)]
pub struct QuestionResult {
    pub question: String,
    pub answer_best: String,
    pub answers_true: Vec<String>,
    pub answers_false: Vec<String>,
    pub scores: Vec<McScores>,
}

/// Results of a full run
#[derive(Debug, Clone, Serialize)]
pub struct EvalResults {
    pub mode: String,
    pub n_questions: usize,
    /// Mean metrics per score slot, in slot order
    pub layers: Vec<(String, LayerTotals)>,
    pub questions: Vec<QuestionResult>,
}

impl EvalResults {
    /// Slot with the highest mean MC2 (earliest wins ties)
    pub fn best_layer(&self) -> Option<&(String, LayerTotals)> {
        self.layers.iter().fold(None, |best, entry| match best {
            Some(b) if b.1.total_mc2 >= entry.1.total_mc2 => Some(b),
            _ => Some(entry),
        })
    }
}

/// Evaluation runner over any answer scorer
pub struct Evaluation<S: AnswerScorer> {
    config: EvalConfig,
    scorer: S,
}

impl<S: AnswerScorer> Evaluation<S> {
    pub fn new(scorer: S, config: EvalConfig) -> Self {
        Self { config, scorer }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Load the dataset (downloading it if needed) and apply debug / shard limits
    pub fn load_dataset(&self) -> Result<Dataset> {
        let path = Dataset::ensure_downloaded(&self.config.data_path)?;
        let mut dataset = Dataset::load(&path)?;
        info!("Loaded {} questions from {}", dataset.len(), path.display());
        self.select(&mut dataset)?;
        Ok(dataset)
    }

    fn select(&self, dataset: &mut Dataset) -> Result<()> {
        if self.config.debug {
            dataset.truncate(DEBUG_QUESTIONS);
        }
        if let Some(shard) = self.config.shard {
            dataset.shard(shard)?;
            info!(
                "Shard {}/{}: {} questions",
                shard.id, shard.total, dataset.len()
            );
        }
        Ok(())
    }

    /// Load the dataset and evaluate it
    pub fn run(&self) -> Result<EvalResults> {
        let dataset = self.load_dataset()?;
        self.evaluate(&dataset)
    }

    /// Evaluate every question of `dataset`
    pub fn evaluate(&self, dataset: &Dataset) -> Result<EvalResults> {
        anyhow::ensure!(!dataset.is_empty(), "No questions to evaluate");

        let mode = self.config.mode;
        let keys = mode.result_keys(self.scorer.n_layers());
        info!("Mode: {:?}, {} score slot(s)", mode, keys.len());

        let mut totals = vec![LayerTotals::default(); keys.len()];
        let mut questions = Vec::with_capacity(dataset.len());

        let progress = progress_bar(dataset.len() as u64);
        for (idx, record) in dataset.records().iter().enumerate() {
            let result = self
                .evaluate_question(record, keys.len())
                .with_context(|| format!("Question {idx}: {}", record.question))?;

            for (slot, scores) in totals.iter_mut().zip(&result.scores) {
                slot.add(scores);
            }
            questions.push(result);
            progress.inc(1);
        }
        progress.finish_and_clear();

        let n = dataset.len() as f64;
        let layers: Vec<(String, LayerTotals)> = keys
            .into_iter()
            .zip(totals)
            .map(|(key, mut t)| {
                t.divide(n);
                info!(
                    "{} MC1/2/3: {}, {}, {}",
                    key, t.total_mc1, t.total_mc2, t.total_mc3
                );
                (key, t)
            })
            .collect();

        Ok(EvalResults {
            mode: mode.file_suffix().to_string(),
            n_questions: dataset.len(),
            layers,
            questions,
        })
    }

    fn evaluate_question(&self, record: &QuestionRecord, n_slots: usize) -> Result<QuestionResult> {
        let format = self.config.answer_format;
        let ref_best = format_best(&record.answer_best, format.close)?;
        let ref_true = split_multi_answer(&record.answer_true, format);
        let ref_false = split_multi_answer(&record.answer_false, format);

        let scores_true = self.score_answers(&record.question, &ref_true, n_slots)?;
        let scores_false = self.score_answers(&record.question, &ref_false, n_slots)?;

        let scores = (0..n_slots)
            .map(|slot| {
                let column_true: Vec<f64> = scores_true.iter().map(|s| s[slot]).collect();
                let column_false: Vec<f64> = scores_false.iter().map(|s| s[slot]).collect();
                mc_calcs(&column_true, &column_false, &ref_true, &ref_best)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(QuestionResult {
            question: record.question.clone(),
            answer_best: ref_best,
            answers_true: ref_true,
            answers_false: ref_false,
            scores,
        })
    }

    /// Score each answer; returns one score vector per answer
    fn score_answers(&self, question: &str, answers: &[String], n_slots: usize) -> Result<Vec<Vec<f64>>> {
        answers
            .iter()
            .map(|answer| {
                let (prompt, continuation) = build_prompt_and_answer(question, answer);
                let scores = self.scorer.lm_score(&prompt, &continuation, self.config.mode)?;
                anyhow::ensure!(
                    scores.len() == n_slots,
                    "Scorer returned {} scores, expected {}",
                    scores.len(),
                    n_slots
                );
                Ok(scores)
            })
            .collect()
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}
