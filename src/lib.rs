//! Word embeddings (skip-gram with negative sampling, GloVe) and a small decoder-only
//! transformer language model, trained on plain text corpora.
//!
//! Tensors and gradients come from `candle-core`; the layers, losses, optimizers and training
//! loops are built here on top of it with a PyTorch-like API.

pub mod checkpoint;
pub mod config;
pub mod dataloader;
pub mod datasets;
pub mod embeddings;
pub mod glove;
pub mod loss;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod plot;
pub mod skipgram;
pub mod tokenizer;
pub mod train;
pub mod transformer;

#[cfg(test)]
#[macro_export]
macro_rules! assert_close {
    ($a:expr, $b:expr) => {
        assert!(
            ((($a) as f64) - (($b) as f64)).abs() < 1e-5,
            "{} is not close to {}",
            $a,
            $b
        );
    };
}
