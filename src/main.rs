//! Trains word embeddings or a character level transformer language model on a text corpus
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run --release -- --use-case glove --files-path data/datasetSentences.txt
//! ```
//!
//! Embedding runs log the nearest neighbours of `--probe-word` and write the vectors as text,
//! language model runs report the held-out loss and print a sample.

use std::{error::Error, fs, path::PathBuf};

use clap::Parser;
use embed_rs::{
    config::{UseCase, parse_device},
    datasets::{Corpus, CooccurrenceDataset, LanguageModelDataset, SkipGramDataset, SkipGramOptions},
    embeddings::WordVectors,
    glove::GloVe,
    plot::plot_losses,
    skipgram::SkipGram,
    tokenizer::{CharTokenizer, Vocab},
    train::{
        TrainConfig, TrainReport, evaluate_language_model, train_glove, train_language_model,
        train_skipgram,
    },
    transformer::{TransformerConfig, TransformerLM},
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(short, long)]
    use_case: UseCase,
    #[clap(short, long, default_value = "data/datasetSentences.txt")]
    files_path: PathBuf,
    #[clap(short, long, default_value_t = 4)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 10)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.001)]
    lr: f64,
    /// `cpu`, `cuda` or `cuda:<n>`
    #[clap(short, long, default_value = "cuda:0")]
    device: String,
    #[clap(short, long, default_value_t = 42)]
    seed: u64,
    #[clap(short, long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[clap(long, default_value_t = 100)]
    log_every: usize,
    #[clap(long, default_value_t = 1000)]
    lr_step_size: usize,
    #[clap(long, default_value_t = 0.5)]
    lr_gamma: f64,
    #[clap(long)]
    max_grad_norm: Option<f64>,
    #[clap(long, default_value_t = false)]
    no_checkpoints: bool,

    // Embeddings
    #[clap(long, default_value_t = 5)]
    window: usize,
    #[clap(long, default_value_t = 1)]
    min_count: u64,
    #[clap(long)]
    max_vocab: Option<usize>,
    /// Frequent word subsampling threshold for skip-gram, e.g. 1e-5
    #[clap(long)]
    subsample: Option<f64>,
    #[clap(long, default_value_t = 100)]
    embedding_dim: usize,
    #[clap(long, default_value_t = 5)]
    neg_samples: usize,
    /// Directory caching the GloVe co-occurrence table between runs
    #[clap(long)]
    cooccurrence_cache: Option<PathBuf>,
    #[clap(long, default_value = "good")]
    probe_word: String,
    #[clap(long, default_value_t = 10)]
    neighbours: usize,

    // Language model
    #[clap(long, default_value_t = 64)]
    context_length: usize,
    #[clap(long, default_value_t = 128)]
    d_model: usize,
    #[clap(long, default_value_t = 2)]
    num_layers: usize,
    #[clap(long, default_value_t = 4)]
    num_heads: usize,
    #[clap(long, default_value_t = 344)]
    d_ff: usize,
    #[clap(long, default_value_t = 10_000.0)]
    rope_theta: f64,
    /// Share of the text held out for evaluation
    #[clap(long, default_value_t = 0.1)]
    validation_split: f64,
    #[clap(long, default_value_t = 200)]
    sample_tokens: usize,
    #[clap(long, default_value_t = 1.0)]
    temperature: f64,
    #[clap(long)]
    top_p: Option<f64>,
    #[clap(long, default_value = "The ")]
    prompt: String,

    /// Save the per-step loss curve as a PNG in the output directory
    #[clap(long, default_value_t = false)]
    plot: bool,
}

impl Args {
    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            batch_size: self.batch_size,
            epochs: self.epochs,
            lr: self.lr,
            seed: self.seed,
            output_dir: self.output_dir.clone(),
            log_every: self.log_every,
            lr_step_size: self.lr_step_size,
            lr_gamma: self.lr_gamma,
            max_grad_norm: self.max_grad_norm,
            shuffle: true,
            save_checkpoints: !self.no_checkpoints,
        }
    }
}

fn report_embeddings(
    args: &Args,
    vocab: Vocab,
    table: &candle_core::Tensor,
) -> Result<(), Box<dyn Error>> {
    let vectors = WordVectors::new(vocab, table)?;
    match vectors.most_similar(&args.probe_word, args.neighbours) {
        Some(neighbours) => {
            log::info!("Nearest neighbours of '{}':", args.probe_word);
            for (word, similarity) in neighbours {
                log::info!("  {word:<20} {similarity:.4}");
            }
        }
        None => log::warn!("'{}' is not in the vocabulary", args.probe_word),
    }
    fs::create_dir_all(&args.output_dir)?;
    let path = args.output_dir.join(format!("{}_vectors.txt", args.use_case));
    vectors.save_text(&path)?;
    log::info!("Word vectors saved to '{}'", path.display());
    Ok(())
}

fn plot(args: &Args, report: &TrainReport) -> Result<(), Box<dyn Error>> {
    if args.plot {
        fs::create_dir_all(&args.output_dir)?;
        let file = args.output_dir.join(format!("{}_loss.png", args.use_case));
        plot_losses(
            &report.step_losses,
            &file.to_string_lossy(),
            &format!("{} training loss", args.use_case),
        )?;
    }
    Ok(())
}

fn run_skipgram(args: &Args, device: &candle_core::Device) -> Result<(), Box<dyn Error>> {
    let corpus = Corpus::from_path(&args.files_path)?;
    let options = SkipGramOptions {
        window: args.window,
        min_count: args.min_count,
        max_vocab: args.max_vocab,
        subsample: args.subsample,
        seed: args.seed,
    };
    let dataset = SkipGramDataset::new(&corpus, &options)?;
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let model = SkipGram::new(
        dataset.vocab().counts(),
        args.embedding_dim,
        args.neg_samples,
        device,
        &mut rng,
    )?;
    let report = train_skipgram(&dataset, &model, &args.train_config())?;
    plot(args, &report)?;
    report_embeddings(args, dataset.vocab().clone(), model.word_vectors())
}

fn run_glove(args: &Args, device: &candle_core::Device) -> Result<(), Box<dyn Error>> {
    let dataset = match &args.cooccurrence_cache {
        Some(dir) => CooccurrenceDataset::load_or_build(
            dir,
            || Corpus::from_path(&args.files_path),
            args.window,
            args.min_count,
            args.max_vocab,
        )?,
        None => CooccurrenceDataset::from_corpus(
            &Corpus::from_path(&args.files_path)?,
            args.window,
            args.min_count,
            args.max_vocab,
        )?,
    };
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let model = GloVe::new(dataset.vocab().len(), args.embedding_dim, device, &mut rng)?;
    let report = train_glove(&dataset, &model, &args.train_config())?;
    plot(args, &report)?;
    report_embeddings(args, dataset.vocab().clone(), &model.word_vectors()?)
}

fn run_language_model(args: &Args, device: &candle_core::Device) -> Result<(), Box<dyn Error>> {
    let text = fs::read_to_string(&args.files_path)?;
    let tokenizer = CharTokenizer::build(&text);
    let tokens = tokenizer.encode(&text)?;
    let split = tokens.len() - (tokens.len() as f64 * args.validation_split.clamp(0.0, 1.0)) as usize;
    let (train_tokens, valid_tokens) = tokens.split_at(split);
    let train_set = LanguageModelDataset::new(train_tokens.to_vec(), args.context_length)?;
    let valid_set = LanguageModelDataset::new(valid_tokens.to_vec(), args.context_length).ok();
    log::info!(
        "{} characters, vocabulary of {}",
        tokens.len(),
        tokenizer.vocab_size()
    );

    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let config = TransformerConfig {
        vocab_size: tokenizer.vocab_size(),
        context_length: args.context_length,
        d_model: args.d_model,
        num_layers: args.num_layers,
        num_heads: args.num_heads,
        d_ff: args.d_ff,
        rope_theta: args.rope_theta,
    };
    let model = TransformerLM::new(config, device, &mut rng)?;
    let report = train_language_model(&train_set, &model, &args.train_config())?;
    plot(args, &report)?;

    match valid_set {
        Some(valid_set) => {
            evaluate_language_model(&valid_set, &model, args.batch_size)?;
        }
        None => log::warn!("Held-out text is shorter than one context window, skipping evaluation"),
    }

    let prompt = tokenizer.encode(&args.prompt)?;
    let sample = model.generate(
        &prompt,
        args.sample_tokens,
        args.temperature,
        args.top_p,
        None,
        &mut rng,
    )?;
    println!("{}{}", args.prompt, tokenizer.decode(&sample)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let device = parse_device(&args.device)?;
    log::info!("Training {} on {:?}", args.use_case, device);

    match args.use_case {
        UseCase::Skipgram => run_skipgram(&args, &device),
        UseCase::Glove => run_glove(&args, &device),
        UseCase::Lm => run_language_model(&args, &device),
    }
}
