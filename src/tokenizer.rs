//! Word and character vocabularies

use std::{
    collections::{BTreeSet, HashMap},
    fs,
    io::{self, BufWriter, Write},
    path::Path,
};

use thiserror::Error;

/// Token used for every word outside the vocabulary. Always has id 0.
pub const UNK: &str = "<unk>";

/// Errors for vocabularies and tokenizers
#[derive(Debug, Error)]
pub enum VocabError {
    #[error("Character {0:?} is not part of the vocabulary")]
    UnknownChar(char),
    #[error("Token id {0} is out of range")]
    UnknownId(u32),
    #[error("Malformed vocabulary line {line}: {content:?}")]
    Malformed { line: usize, content: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Lowercases a line and splits it on whitespace
pub fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(|t| t.to_lowercase()).collect()
}

/// Word vocabulary with token counts
#[derive(Debug, Clone, PartialEq)]
pub struct Vocab {
    token_to_id: HashMap<String, u32>,
    id_to_token: Vec<String>,
    counts: Vec<u64>,
}

impl Vocab {
    /// Builds a vocabulary from a stream of tokens.
    ///
    /// Words seen fewer than `min_count` times, or that fall outside the `max_size` most frequent
    /// words, are folded into [`UNK`]. Ids are ordered by descending count, ties broken
    /// lexicographically so the result does not depend on input order.
    pub fn build<I, S>(tokens: I, min_count: u64, max_size: Option<usize>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw: HashMap<String, u64> = HashMap::new();
        // literal <unk> tokens already in the text count towards id 0
        let mut unk_count = 0;
        for token in tokens {
            let token = token.as_ref();
            if token == UNK {
                unk_count += 1;
                continue;
            }
            *raw.entry(token.to_string()).or_default() += 1;
        }

        let mut sorted = raw.into_iter().collect::<Vec<_>>();
        sorted.sort_by(|(ta, ca), (tb, cb)| cb.cmp(ca).then_with(|| ta.cmp(tb)));

        // the unknown token takes one slot of the size cap
        let keep = max_size.map(|m| m.saturating_sub(1)).unwrap_or(usize::MAX);
        let mut id_to_token = vec![UNK.to_string()];
        let mut counts = vec![0];
        for (token, count) in sorted {
            if count < min_count || id_to_token.len() - 1 >= keep {
                unk_count += count;
                continue;
            }
            id_to_token.push(token);
            counts.push(count);
        }
        counts[0] = unk_count;
        Self::from_parts(id_to_token, counts)
    }

    fn from_parts(id_to_token: Vec<String>, counts: Vec<u64>) -> Self {
        let token_to_id = id_to_token
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self {
            token_to_id,
            id_to_token,
            counts,
        }
    }

    /// Id of a token, or the id of [`UNK`] when the token is unknown
    pub fn id(&self, token: &str) -> u32 {
        self.token_to_id.get(token).copied().unwrap_or(0)
    }

    /// Returns the id only if the token is in the vocabulary
    pub fn get(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        // UNK is always present
        false
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn encode<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<u32> {
        tokens.iter().map(|t| self.id(t.as_ref())).collect()
    }

    /// Writes one `token\tcount` line per id
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), VocabError> {
        let mut out = BufWriter::new(fs::File::create(path)?);
        for (token, count) in self.id_to_token.iter().zip(self.counts.iter()) {
            writeln!(out, "{token}\t{count}")?;
        }
        out.flush()?;
        Ok(())
    }

    /// Reads a vocabulary written by [`Vocab::save`], preserving its ids
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, VocabError> {
        let content = fs::read_to_string(path)?;
        let mut id_to_token = Vec::new();
        let mut counts = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let malformed = || VocabError::Malformed {
                line: idx + 1,
                content: line.to_string(),
            };
            let (token, count) = line.rsplit_once('\t').ok_or_else(malformed)?;
            let count = count.parse::<u64>().map_err(|_| malformed())?;
            id_to_token.push(token.to_string());
            counts.push(count);
        }
        if id_to_token.first().map(String::as_str) != Some(UNK) {
            return Err(VocabError::Malformed {
                line: 1,
                content: format!("expected {UNK} as the first token"),
            });
        }
        Ok(Self::from_parts(id_to_token, counts))
    }
}

/// Character level tokenizer used for the language model
#[derive(Debug, Clone, PartialEq)]
pub struct CharTokenizer {
    chars: Vec<char>,
    index: HashMap<char, u32>,
}

impl CharTokenizer {
    /// Uses the sorted set of characters appearing in `text` as the vocabulary
    pub fn build(text: &str) -> Self {
        let chars = text.chars().collect::<BTreeSet<_>>().into_iter().collect::<Vec<_>>();
        let index = chars
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i as u32))
            .collect();
        Self { chars, index }
    }

    pub fn vocab_size(&self) -> usize {
        self.chars.len()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, VocabError> {
        text.chars()
            .map(|c| self.index.get(&c).copied().ok_or(VocabError::UnknownChar(c)))
            .collect()
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String, VocabError> {
        ids.iter()
            .map(|&id| {
                self.chars
                    .get(id as usize)
                    .copied()
                    .ok_or(VocabError::UnknownId(id))
            })
            .collect()
    }
}
