//! ONNX sentence embeddings via fastembed
//!
//! The model is loaded lazily on the first embedding call, so opening an index
//! for lexical-only work never pays the model start-up cost. A failed load is
//! reported as `ModelUnavailable` and retried on the next call.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Mutex;

use super::{Embedder, ModelType};
use crate::constants::DEFAULT_EMBED_BATCH_SIZE;
use crate::error::{Result, StudySearchError};

pub struct FastEmbedder {
    model_type: ModelType,
    cache_dir: Option<PathBuf>,
    batch_size: usize,
    model: Mutex<Option<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn new(model_type: ModelType, cache_dir: Option<PathBuf>) -> Result<Self> {
        if model_type == ModelType::Hashed {
            return Err(StudySearchError::config(
                "FastEmbedder needs an ONNX model, not the hashed embedder",
            ));
        }
        Ok(Self {
            model_type,
            cache_dir,
            batch_size: DEFAULT_EMBED_BATCH_SIZE,
            model: Mutex::new(None),
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn fastembed_model(&self) -> EmbeddingModel {
        match self.model_type {
            ModelType::BgeSmallEnV15 => EmbeddingModel::BGESmallENV15,
            _ => EmbeddingModel::AllMiniLML6V2,
        }
    }

    fn load(&self) -> Result<TextEmbedding> {
        tracing::info!("Loading embedding model {}", self.model_type.name());

        let mut options =
            InitOptions::new(self.fastembed_model()).with_show_download_progress(false);
        if let Some(dir) = &self.cache_dir {
            std::fs::create_dir_all(dir).map_err(|e| StudySearchError::io(dir, e.to_string()))?;
            options = options.with_cache_dir(dir.clone());
        }

        TextEmbedding::try_new(options).map_err(|e| {
            StudySearchError::model_unavailable(format!(
                "failed to load {}: {}",
                self.model_type.name(),
                e
            ))
        })
    }
}

impl Embedder for FastEmbedder {
    fn model_id(&self) -> &str {
        self.model_type.short_name()
    }

    fn dimensions(&self) -> usize {
        self.model_type.dimensions()
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self
            .model
            .lock()
            .map_err(|e| StudySearchError::model_unavailable(format!("model mutex poisoned: {}", e)))?;

        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| StudySearchError::model_unavailable("model not loaded"))?;

        model
            .embed(texts.to_vec(), Some(self.batch_size))
            .map_err(|e| StudySearchError::model_unavailable(format!("inference failed: {}", e)))
    }
}
