//! tfqa-rs CLI: TruthfulQA multiple-choice evaluation

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tfqa_rs::{
    print_summary, write_report, AnswerFormat, AnswerScorer, EvalConfig, Evaluation, ScoreMode,
    Shard, TfqaModel,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    /// `;`-separated answers closed with a period
    Truthfulqa,
    /// `,`-separated answers with a trailing separator
    Factual,
}

#[derive(Parser)]
#[command(name = "tfqa-rs")]
#[command(about = "TruthfulQA multiple-choice evaluation, optionally per layer")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` or a local checkpoint directory
    #[arg(long, default_value = "huggyllama/llama-7b")]
    model_name: String,

    /// Directory holding TruthfulQA.csv (downloaded if missing)
    #[arg(long, default_value = "./tfqa")]
    data_path: PathBuf,

    /// Output path stem; mode suffix and extension are appended
    #[arg(long, default_value = "./tfqa_result")]
    output_path: String,

    /// Score through the lm_head after every decoder layer
    #[arg(long, conflicts_with = "attention")]
    layer_wise: bool,

    /// Score through the lm_head after every attention block
    #[arg(long)]
    attention: bool,

    /// Evaluate only the first 10 questions
    #[arg(long)]
    debug: bool,

    /// Evaluate one shard of the dataset
    #[arg(long, requires = "shard_id")]
    parallel: bool,

    /// Number of shards in parallel mode
    #[arg(long, default_value_t = 8)]
    total_shard: usize,

    /// Shard to evaluate in parallel mode
    #[arg(long)]
    shard_id: Option<usize>,

    /// Reference answer layout
    #[arg(long, value_enum, default_value = "truthfulqa")]
    answer_format: Format,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn eval_config(&self) -> EvalConfig {
        let mode = if self.layer_wise {
            ScoreMode::LayerWise
        } else if self.attention {
            ScoreMode::Attention
        } else {
            ScoreMode::Baseline
        };

        let shard = match (self.parallel, self.shard_id) {
            (true, Some(id)) => Some(Shard {
                total: self.total_shard,
                id,
            }),
            _ => None,
        };

        let answer_format = match self.answer_format {
            Format::Truthfulqa => AnswerFormat::truthfulqa(),
            Format::Factual => AnswerFormat::factual(),
        };

        EvalConfig {
            data_path: self.data_path.clone(),
            output_path: self.output_path.clone(),
            mode,
            debug: self.debug,
            shard,
            answer_format,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.eval_config();

    println!("=== tfqa-rs: TruthfulQA MC evaluation ===");
    println!("Model:  {}", cli.model_name);
    println!("Data:   {}", config.data_path.display());
    println!("Output: {}", config.output_path);
    println!("Mode:   {:?}", config.mode);

    let model = TfqaModel::from_pretrained_with_device(&cli.model_name, cli.cpu)?;
    info!("Model: {} layers, {} hidden", model.n_layers(), model.d_model());

    let evaluation = Evaluation::new(model, config);
    let results = evaluation.run()?;

    println!();
    print_summary(&results);

    write_report(&results, &evaluation.config().output_path)?;

    Ok(())
}
