//! Trained word vectors: nearest neighbour queries and text export

use std::{
    fs,
    io::{BufWriter, Write},
    path::Path,
};

use candle_core::Tensor;

use crate::{nn::NNError, tokenizer::Vocab};

/// A vocabulary paired with one vector per word
pub struct WordVectors {
    vocab: Vocab,
    vectors: Vec<Vec<f32>>,
}

impl WordVectors {
    /// `table` is `[vocab, dim]`, row `i` belonging to word id `i`
    pub fn new(vocab: Vocab, table: &Tensor) -> Result<Self, NNError> {
        let (rows, _) = table.dims2()?;
        if rows != vocab.len() {
            return Err(NNError::InputSizeMismatch {
                expected: vocab.len(),
                got: rows,
            });
        }
        let vectors = table.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        Ok(Self { vocab, vectors })
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn vector(&self, word: &str) -> Option<&[f32]> {
        self.vocab
            .get(word)
            .map(|id| self.vectors[id as usize].as_slice())
    }

    /// The `k` words with the highest cosine similarity to `word`, excluding `word` itself
    /// and the unknown token. `None` when `word` is not in the vocabulary.
    pub fn most_similar(&self, word: &str, k: usize) -> Option<Vec<(&str, f32)>> {
        let id = self.vocab.get(word)? as usize;
        let query = &self.vectors[id];
        let mut scored = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != id && *i != 0)
            .map(|(i, v)| (i, cosine(query, v)))
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Some(
            scored
                .into_iter()
                .take(k)
                .filter_map(|(i, score)| self.vocab.token(i as u32).map(|t| (t, score)))
                .collect(),
        )
    }

    /// Writes `word v1 v2 ...` lines, the plain text format used by the GloVe release
    pub fn save_text<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let path = path.as_ref();
        let mut out = BufWriter::new(fs::File::create(path)?);
        for (id, vector) in self.vectors.iter().enumerate() {
            let Some(token) = self.vocab.token(id as u32) else {
                continue;
            };
            write!(out, "{token}")?;
            for v in vector {
                write!(out, " {v}")?;
            }
            writeln!(out)?;
        }
        out.flush()?;
        log::info!("Saved {} word vectors to '{}'", self.vectors.len(), path.display());
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::{assert_close, tokenizer::tokenize};

    fn word_vectors() -> WordVectors {
        // ids: <unk>=0, king=1, man=2, queen=3 (ordered by count then name)
        let vocab = Vocab::build(tokenize("king king king man man queen"), 1, None);
        let table = Tensor::new(
            &[[0f32, 0.0], [1.0, 1.0], [-1.0, 0.0], [1.0, 0.9]],
            &Device::Cpu,
        )
        .unwrap();
        WordVectors::new(vocab, &table).unwrap()
    }

    #[test]
    fn test_most_similar() {
        let vectors = word_vectors();
        let similar = vectors.most_similar("king", 2).unwrap();
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].0, "queen");
        assert_eq!(similar[1].0, "man");
        assert!(similar[0].1 > 0.99);
        assert_close!(similar[1].1, -std::f32::consts::FRAC_1_SQRT_2);
        assert!(vectors.most_similar("emperor", 2).is_none());
    }

    #[test]
    fn test_size_mismatch() {
        let vocab = Vocab::build(tokenize("a b"), 1, None);
        let table = Tensor::zeros((5, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            WordVectors::new(vocab, &table),
            Err(NNError::InputSizeMismatch {
                expected: 3,
                got: 5
            })
        ));
    }

    #[test]
    fn test_save_text() {
        let vectors = word_vectors();
        let path = std::env::temp_dir().join(format!("embed_rs_vectors_{}.txt", std::process::id()));
        vectors.save_text(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "king 1 1");
        assert_eq!(lines[3], "queen 1 0.9");
        assert_eq!(vectors.vector("man"), Some([-1.0f32, 0.0].as_slice()));
    }
}
