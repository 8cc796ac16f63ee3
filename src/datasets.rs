//! Map-style datasets for the embedding models and the language model
//!
//! Each dataset owns fully materialized examples and hands them out by index, the way
//! `torch.utils.data.Dataset` does, so [`crate::dataloader::DataLoader`] can batch and shuffle
//! any of them.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::tokenizer::{Vocab, VocabError, tokenize};

/// File names used by the co-occurrence cache directory
const COOCCURRENCE_FILE: &str = "cooccurrence.safetensors";
const VOCAB_FILE: &str = "vocab.tsv";
const SETTINGS_TENSOR: &str = "settings";

/// Errors for building and loading datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Dataset is empty: {0}")]
    Empty(&'static str),
    #[error("Token stream of length {len} is too short for context length {context_length}")]
    TooShort { len: usize, context_length: usize },
    #[error("Window size must be at least 1")]
    ZeroWindow,
    #[error("Cache entry '{0}' is missing or malformed")]
    MalformedCache(String),
    #[error(transparent)]
    Vocab(#[from] VocabError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// A dataset of indexable examples
pub trait Dataset {
    type Item;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the example at `idx`. Panics if `idx >= len()`, like slice indexing.
    fn get(&self, idx: usize) -> Self::Item;
}

/// Tokenized sentences read from a text file
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    sentences: Vec<Vec<String>>,
}

impl Corpus {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let corpus = Self::from_text(&text);
        log::info!(
            "Loaded {} sentences ({} tokens) from '{}'",
            corpus.sentences.len(),
            corpus.num_tokens(),
            path.display()
        );
        Ok(corpus)
    }

    /// One sentence per line. `<index>\t<sentence>` lines keep only the sentence, so the
    /// Stanford Sentiment `datasetSentences.txt` file can be used as is. Its
    /// `sentence_index\tsentence` header is skipped: a first line is a header when it is not
    /// indexed itself but the line after it is.
    pub fn from_text(text: &str) -> Self {
        let mut lines = text.lines().peekable();
        if let Some(first) = lines.next_if(|first| Self::index_of(first).is_none()) {
            let header = first.contains('\t')
                && lines.peek().is_some_and(|next| Self::index_of(next).is_some());
            if !header {
                return Self::from_lines(std::iter::once(first).chain(lines));
            }
        }
        Self::from_lines(lines)
    }

    fn from_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        let sentences = lines
            .map(Self::parse_line)
            .filter(|s| !s.is_empty())
            .collect();
        Self { sentences }
    }

    /// The `<index>` of an `<index>\t<sentence>` line
    fn index_of(line: &str) -> Option<usize> {
        line.split_once('\t')
            .and_then(|(idx, _)| idx.trim().parse::<usize>().ok())
    }

    fn parse_line(line: &str) -> Vec<String> {
        match line.split_once('\t') {
            Some((_, sentence)) if Self::index_of(line).is_some() => tokenize(sentence),
            _ => tokenize(line),
        }
    }

    pub fn sentences(&self) -> &[Vec<String>] {
        &self.sentences
    }

    pub fn num_tokens(&self) -> usize {
        self.sentences.iter().map(Vec::len).sum()
    }

    pub fn build_vocab(&self, min_count: u64, max_size: Option<usize>) -> Vocab {
        Vocab::build(self.sentences.iter().flatten(), min_count, max_size)
    }

    /// Sentences as vocabulary ids
    pub fn encode(&self, vocab: &Vocab) -> Vec<Vec<u32>> {
        self.sentences.iter().map(|s| vocab.encode(s)).collect()
    }
}

/// Options for [`SkipGramDataset`]
#[derive(Debug, Clone)]
pub struct SkipGramOptions {
    /// Number of context words taken on each side of the center word
    pub window: usize,
    pub min_count: u64,
    pub max_vocab: Option<usize>,
    /// Subsampling threshold `t`, usually around `1e-5`. `None` keeps every token.
    pub subsample: Option<f64>,
    pub seed: u64,
}

impl Default for SkipGramOptions {
    fn default() -> Self {
        Self {
            window: 5,
            min_count: 1,
            max_vocab: None,
            subsample: None,
            seed: 42,
        }
    }
}

/// (center, context) word id pairs for skip-gram training
#[derive(Debug, Clone)]
pub struct SkipGramDataset {
    vocab: Vocab,
    pairs: Vec<(u32, u32)>,
}

impl SkipGramDataset {
    pub fn new(corpus: &Corpus, options: &SkipGramOptions) -> Result<Self, DatasetError> {
        if options.window == 0 {
            return Err(DatasetError::ZeroWindow);
        }
        let vocab = corpus.build_vocab(options.min_count, options.max_vocab);
        let mut rng = Pcg64Mcg::seed_from_u64(options.seed);
        let total = vocab.total_count() as f64;
        let discard = |id: u32, rng: &mut Pcg64Mcg| match options.subsample {
            Some(t) => {
                let freq = vocab.counts()[id as usize] as f64 / total;
                let p = (1.0 - (t / freq).sqrt()).max(0.0);
                rng.random::<f64>() < p
            }
            None => false,
        };

        let mut pairs = Vec::new();
        for sentence in corpus.encode(&vocab) {
            let kept = sentence
                .into_iter()
                .filter(|&id| id != 0)
                .filter(|&id| !discard(id, &mut rng))
                .collect::<Vec<_>>();
            for (i, &center) in kept.iter().enumerate() {
                let lo = i.saturating_sub(options.window);
                let hi = (i + options.window + 1).min(kept.len());
                pairs.extend(
                    (lo..hi)
                        .filter(|&j| j != i)
                        .map(|j| (center, kept[j])),
                );
            }
        }
        if pairs.is_empty() {
            return Err(DatasetError::Empty("no skip-gram pairs"));
        }
        log::info!(
            "Built {} skip-gram pairs over a vocabulary of {} words",
            pairs.len(),
            vocab.len()
        );
        Ok(Self { vocab, pairs })
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn pairs(&self) -> &[(u32, u32)] {
        &self.pairs
    }
}

impl Dataset for SkipGramDataset {
    type Item = (u32, u32);

    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, idx: usize) -> Self::Item {
        self.pairs[idx]
    }
}

/// A single non-zero entry `X_ij` of the co-occurrence matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cooccurrence {
    pub row: u32,
    pub col: u32,
    pub count: f32,
}

/// Counting settings a co-occurrence table was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooccurrenceSettings {
    pub window: usize,
    pub min_count: u64,
    pub max_vocab: Option<usize>,
}

impl CooccurrenceSettings {
    /// `[window, min_count, max_vocab]` with `-1` for no vocabulary cap
    fn to_tensor(self) -> Result<Tensor, DatasetError> {
        let max_vocab = self.max_vocab.map_or(-1, |m| m as i64);
        Ok(Tensor::new(
            &[self.window as i64, self.min_count as i64, max_vocab],
            &Device::Cpu,
        )?)
    }

    fn from_tensor(tensor: &Tensor) -> Result<Self, DatasetError> {
        let malformed = || DatasetError::MalformedCache(SETTINGS_TENSOR.to_string());
        let values = tensor.to_vec1::<i64>().map_err(|_| malformed())?;
        match values.as_slice() {
            &[window, min_count, max_vocab] if window > 0 && min_count >= 0 => Ok(Self {
                window: window as usize,
                min_count: min_count as u64,
                max_vocab: (max_vocab >= 0).then_some(max_vocab as usize),
            }),
            _ => Err(malformed()),
        }
    }
}

/// Sparse word-word co-occurrence counts for GloVe
#[derive(Debug, Clone)]
pub struct CooccurrenceDataset {
    vocab: Vocab,
    entries: Vec<Cooccurrence>,
    settings: CooccurrenceSettings,
}

impl CooccurrenceDataset {
    /// Counts co-occurrences within `window` words on either side. A pair at distance `d`
    /// contributes `1/d`, and both `(i, j)` and `(j, i)` are recorded.
    pub fn from_corpus(
        corpus: &Corpus,
        window: usize,
        min_count: u64,
        max_vocab: Option<usize>,
    ) -> Result<Self, DatasetError> {
        if window == 0 {
            return Err(DatasetError::ZeroWindow);
        }
        let vocab = corpus.build_vocab(min_count, max_vocab);
        let mut counts: HashMap<(u32, u32), f32> = HashMap::new();
        for sentence in corpus.encode(&vocab) {
            for (i, &a) in sentence.iter().enumerate() {
                if a == 0 {
                    continue;
                }
                let hi = (i + window + 1).min(sentence.len());
                for (j, &b) in sentence.iter().enumerate().take(hi).skip(i + 1) {
                    if b == 0 {
                        continue;
                    }
                    let weight = 1.0 / (j - i) as f32;
                    *counts.entry((a, b)).or_default() += weight;
                    *counts.entry((b, a)).or_default() += weight;
                }
            }
        }
        let mut entries = counts
            .into_iter()
            .map(|((row, col), count)| Cooccurrence { row, col, count })
            .collect::<Vec<_>>();
        entries.sort_by_key(|e| (e.row, e.col));
        if entries.is_empty() {
            return Err(DatasetError::Empty("no co-occurrences"));
        }
        log::info!(
            "Built {} co-occurrence entries over a vocabulary of {} words",
            entries.len(),
            vocab.len()
        );
        Ok(Self {
            vocab,
            entries,
            settings: CooccurrenceSettings {
                window,
                min_count,
                max_vocab,
            },
        })
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn settings(&self) -> CooccurrenceSettings {
        self.settings
    }

    pub fn entries(&self) -> &[Cooccurrence] {
        &self.entries
    }

    /// Writes the table and its vocabulary into `dir` so later runs can skip counting
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<(), DatasetError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let n = self.entries.len();
        let pairs = self
            .entries
            .iter()
            .flat_map(|e| [e.row, e.col])
            .collect::<Vec<_>>();
        let counts = self.entries.iter().map(|e| e.count).collect::<Vec<_>>();
        let tensors = HashMap::from([
            ("pairs".to_string(), Tensor::from_vec(pairs, (n, 2), &Device::Cpu)?),
            ("counts".to_string(), Tensor::from_vec(counts, n, &Device::Cpu)?),
            (SETTINGS_TENSOR.to_string(), self.settings.to_tensor()?),
        ]);
        candle_core::safetensors::save(&tensors, dir.join(COOCCURRENCE_FILE))?;
        self.vocab.save(dir.join(VOCAB_FILE))?;
        log::info!("Saved co-occurrence cache to '{}'", dir.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, DatasetError> {
        let dir = dir.as_ref();
        let vocab = Vocab::load(dir.join(VOCAB_FILE))?;
        let tensors = candle_core::safetensors::load(dir.join(COOCCURRENCE_FILE), &Device::Cpu)?;
        let pairs = tensors
            .get("pairs")
            .ok_or_else(|| DatasetError::MalformedCache("pairs".to_string()))?
            .to_vec2::<u32>()?;
        let counts = tensors
            .get("counts")
            .ok_or_else(|| DatasetError::MalformedCache("counts".to_string()))?
            .to_vec1::<f32>()?;
        let settings = CooccurrenceSettings::from_tensor(
            tensors
                .get(SETTINGS_TENSOR)
                .ok_or_else(|| DatasetError::MalformedCache(SETTINGS_TENSOR.to_string()))?,
        )?;
        if pairs.len() != counts.len() {
            return Err(DatasetError::MalformedCache("counts".to_string()));
        }
        let entries = pairs
            .into_iter()
            .zip(counts)
            .map(|(pair, count)| Cooccurrence {
                row: pair[0],
                col: pair[1],
                count,
            })
            .collect::<Vec<_>>();
        if entries.is_empty() {
            return Err(DatasetError::Empty("no co-occurrences"));
        }
        log::info!(
            "Loaded {} co-occurrence entries from '{}'",
            entries.len(),
            dir.display()
        );
        Ok(Self {
            vocab,
            entries,
            settings,
        })
    }

    /// Loads the cache in `dir` when it exists and was built with the same settings, otherwise
    /// builds the table from the corpus and stores it in `dir`
    pub fn load_or_build<P: AsRef<Path>>(
        dir: P,
        corpus: impl FnOnce() -> Result<Corpus, DatasetError>,
        window: usize,
        min_count: u64,
        max_vocab: Option<usize>,
    ) -> Result<Self, DatasetError> {
        let dir = dir.as_ref();
        let settings = CooccurrenceSettings {
            window,
            min_count,
            max_vocab,
        };
        if dir.join(COOCCURRENCE_FILE).exists() && dir.join(VOCAB_FILE).exists() {
            match Self::load(dir) {
                Ok(cached) if cached.settings == settings => return Ok(cached),
                Ok(cached) => log::warn!(
                    "Co-occurrence cache in '{}' was built with {:?}, rebuilding for {:?}",
                    dir.display(),
                    cached.settings,
                    settings
                ),
                Err(e) => log::warn!(
                    "Ignoring unreadable co-occurrence cache in '{}': {e}",
                    dir.display()
                ),
            }
        }
        let dataset = Self::from_corpus(&corpus()?, window, min_count, max_vocab)?;
        dataset.save(dir)?;
        Ok(dataset)
    }
}

impl Dataset for CooccurrenceDataset {
    type Item = Cooccurrence;

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, idx: usize) -> Self::Item {
        self.entries[idx]
    }
}

/// Token stream cut into non-overlapping next-token prediction windows
#[derive(Debug, Clone)]
pub struct LanguageModelDataset {
    tokens: Vec<u32>,
    context_length: usize,
}

impl LanguageModelDataset {
    pub fn new(tokens: Vec<u32>, context_length: usize) -> Result<Self, DatasetError> {
        if context_length == 0 || tokens.len() <= context_length {
            return Err(DatasetError::TooShort {
                len: tokens.len(),
                context_length,
            });
        }
        Ok(Self {
            tokens,
            context_length,
        })
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }
}

impl Dataset for LanguageModelDataset {
    /// (inputs, targets), targets being the inputs shifted left by one token
    type Item = (Vec<u32>, Vec<u32>);

    fn len(&self) -> usize {
        (self.tokens.len() - 1) / self.context_length
    }

    fn get(&self, idx: usize) -> Self::Item {
        let start = idx * self.context_length;
        let end = start + self.context_length;
        (
            self.tokens[start..end].to_vec(),
            self.tokens[start + 1..end + 1].to_vec(),
        )
    }
}
