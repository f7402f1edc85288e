//! Deterministic feature-hashing embedder
//!
//! Every lowercase word token is hashed with SHA-256 into one of `dimensions`
//! buckets; the bucket counts are L2-normalized. Texts sharing words get a
//! positive cosine similarity, unrelated texts land near zero. No model
//! download, no state, identical output on every machine.

use sha2::{Digest, Sha256};

use super::Embedder;
use crate::error::{Result, StudySearchError};

pub struct HashedEmbedder {
    dimensions: usize,
    model_id: String,
}

impl HashedEmbedder {
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(StudySearchError::config(
                "hashed embedder needs at least one dimension",
            ));
        }
        Ok(Self {
            dimensions,
            model_id: format!("hashed-sha256-{}", dimensions),
        })
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.dimensions as u64) as usize
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

/// Lowercase alphanumeric runs, the same split the lexical tokenizer uses
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

impl Embedder for HashedEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::cosine_similarity;

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashedEmbedder::new(64).unwrap();
        let a = embedder.embed("Derivative of x squared").unwrap();
        let b = embedder.embed("derivative OF x, squared!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_words_are_closer() {
        let embedder = HashedEmbedder::new(384).unwrap();
        let query = embedder.embed("derivative rules").unwrap();
        let related = embedder.embed("derivative of x squared").unwrap();
        let unrelated = embedder.embed("French Revolution causes").unwrap();
        assert!(
            cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated)
        );
    }

    #[test]
    fn test_batch_preserves_order() {
        let embedder = HashedEmbedder::new(32).unwrap();
        let texts = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let batch = embedder.embed_batch(&texts).unwrap();
        assert_eq!(batch.len(), 3);
        for (text, vector) in texts.iter().zip(&batch) {
            assert_eq!(&embedder.embed(text).unwrap(), vector);
        }
    }

    #[test]
    fn test_punctuation_only_is_zero_vector() {
        let embedder = HashedEmbedder::new(16).unwrap();
        let v = embedder.embed("?!").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(HashedEmbedder::new(0).is_err());
    }
}
