// Pedantic clippy configuration for ML/math codebase
#![allow(clippy::cast_precision_loss)] // usize→f64 when averaging and building rope tables
#![allow(clippy::cast_possible_truncation)] // f64→f32 rope frequencies
#![allow(clippy::module_name_repetitions)] // TfqaModel in model.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! tfqa-rs: TruthfulQA multiple-choice evaluation
//!
//! Scores the reference answers of each TruthfulQA question by their
//! log-likelihood under a causal LM and reports MC1/MC2/MC3, either at the
//! final layer or for every layer through a logit lens.
//!
//! ## Architecture
//!
//! - `dataset`: TruthfulQA CSV loading, answer splitting, sharding
//! - `prompt`: Few-shot prompt construction
//! - `metrics`: MC1/MC2/MC3 from per-answer scores
//! - `masks`: Cached causal attention masks
//! - `cache`: Per-layer residual stream capture
//! - `forward_llama`: LLaMA forward pass with residual capture
//! - `logit_lens`: Answer log-likelihood from (intermediate) logits
//! - `model`: TfqaModel wrapper and the `AnswerScorer` trait
//! - `evaluate`: Evaluation loop and score aggregation
//! - `report`: CSV / JSON result files and console summary

pub mod cache;
pub mod dataset;
pub mod evaluate;
pub mod forward_llama;
pub mod logit_lens;
pub mod masks;
pub mod metrics;
pub mod model;
pub mod prompt;
pub mod report;

pub use cache::{ActivationCache, CapturePoint};
pub use dataset::{format_best, split_multi_answer, AnswerFormat, Dataset, QuestionRecord, Shard};
pub use evaluate::{EvalConfig, EvalResults, Evaluation, LayerTotals, QuestionResult};
pub use forward_llama::{LlamaConfig, TfqaLlama};
pub use logit_lens::continuation_log_prob;
pub use masks::causal_mask;
pub use metrics::{mc_calcs, McScores};
pub use model::{AnswerScorer, ModelFiles, ScoreMode, TfqaModel};
pub use prompt::{build_prompt, build_prompt_and_answer, build_prompt_with_answer, demo_text};
pub use report::{print_summary, write_report, ReportPaths};
