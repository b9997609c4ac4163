//! Embedding provider abstraction and the local tract-based implementation.
//!
//! Defines the [`Embedder`] trait — the external black-box text-to-vector
//! function the index depends on — and [`TractEmbedder`], a pure-Rust
//! pipeline that loads the all-MiniLM-L6-v2 ONNX model with tract-onnx,
//! tokenizes with the tokenizers crate, mean-pools, and L2-normalises.
//! No ONNX Runtime or system deps.
//!
//! The index assumes the embedder is deterministic, pure, and slow enough
//! to justify caching. Calls are made from the blocking thread pool.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tract_onnx::prelude::*;

const ALL_MINILM_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const ALL_MINILM_DIMS: usize = 384;
const DEFAULT_MAX_LEN: usize = 256;

/// Batch text-to-vector function.
///
/// Implementations must be deterministic: the same text maps to the same
/// vector across runs, which is what makes the content-addressed cache
/// valid. Vectors are normalised by the caller before storage.
pub trait Embedder: Send + Sync {
    /// Model identifier; persisted with the cache and used as a
    /// compatibility guard.
    fn model_id(&self) -> &str;

    /// Embedding dimensionality (e.g. 384).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Scale a vector to unit L2 norm (no-op on the zero vector).
pub fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Dot product of two equal-length vectors.
///
/// For unit-norm vectors this is the cosine similarity.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ============ Tract (local ONNX) embedder ============

struct LoadedModel {
    tokenizer: tokenizers::Tokenizer,
    plan: TypedSimplePlan<TypedModel>,
    dims: usize,
}

/// Local embedding pipeline backed by tract-onnx.
///
/// The ONNX model and tokenizer are downloaded into `model_cache_dir` on
/// first use and loaded lazily on the first `embed` call.
pub struct TractEmbedder {
    model_name: String,
    batch_size: usize,
    model_cache_dir: PathBuf,
    loaded: Mutex<Option<Arc<LoadedModel>>>,
}

impl TractEmbedder {
    pub fn new(model_name: &str, batch_size: usize, model_cache_dir: PathBuf) -> TractEmbedder {
        TractEmbedder {
            model_name: model_name.to_string(),
            batch_size,
            model_cache_dir,
            loaded: Mutex::new(None),
        }
    }

    fn ensure_loaded(&self) -> Result<Arc<LoadedModel>> {
        let mut guard = self.loaded.lock();
        if let Some(loaded) = guard.as_ref() {
            return Ok(loaded.clone());
        }

        let (_, _, dims) = model_manifest(&self.model_name)?;
        let (onnx_path, tokenizer_path) = self.ensure_cached()?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Load tokenizer: {}", e))?;

        let plan = tract_onnx::onnx()
            .model_for_path(&onnx_path)
            .map_err(|e| anyhow::anyhow!("Load ONNX: {}", e))?
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("Optimize: {}", e))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("Build tract runnable: {}", e))?;

        let loaded = Arc::new(LoadedModel {
            tokenizer,
            plan,
            dims,
        });
        *guard = Some(loaded.clone());
        Ok(loaded)
    }

    /// Ensure model and tokenizer are in cache; return (onnx path, tokenizer path).
    fn ensure_cached(&self) -> Result<(PathBuf, PathBuf)> {
        let (onnx_rel, tokenizer_rel, _) = model_manifest(&self.model_name)?;
        let model_dir = self.model_cache_dir.join(&self.model_name);
        let onnx_path = model_dir.join(onnx_rel);
        let tokenizer_path = model_dir.join(tokenizer_rel);
        download_to_cache(ALL_MINILM_REPO, onnx_rel, &onnx_path)?;
        download_to_cache(ALL_MINILM_REPO, tokenizer_rel, &tokenizer_path)?;
        Ok((onnx_path, tokenizer_path))
    }
}

impl Embedder for TractEmbedder {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        ALL_MINILM_DIMS
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let loaded = self.ensure_loaded()?;
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size.max(1)) {
            let encodings: Vec<_> = chunk
                .iter()
                .map(|s| {
                    loaded
                        .tokenizer
                        .encode(s.as_str(), true)
                        .map_err(|e| anyhow::anyhow!("Tokenize: {}", e))
                })
                .collect::<Result<Vec<_>>>()?;

            let max_len = encodings
                .iter()
                .map(|e| e.get_ids().len())
                .max()
                .unwrap_or(1)
                .min(DEFAULT_MAX_LEN);

            let batch = encodings.len();
            let mut input_ids = vec![0i64; batch * max_len];
            let mut attention_mask = vec![0i64; batch * max_len];

            for (i, enc) in encodings.iter().enumerate() {
                let ids = enc.get_ids();
                let len = ids.len().min(max_len);
                for (j, &id) in ids.iter().take(len).enumerate() {
                    input_ids[i * max_len + j] = id as i64;
                    attention_mask[i * max_len + j] = 1;
                }
            }

            let input_ids_tensor = ndarray::Array2::from_shape_vec((batch, max_len), input_ids)
                .map_err(|e| anyhow::anyhow!("Input ids shape: {}", e))?;
            let attention_mask_tensor =
                ndarray::Array2::from_shape_vec((batch, max_len), attention_mask)
                    .map_err(|e| anyhow::anyhow!("Attention mask shape: {}", e))?;

            let input_ids_t: Tensor = input_ids_tensor.into();
            let attention_mask_t: Tensor = attention_mask_tensor.into();
            let result = loaded
                .plan
                .run(tvec!(input_ids_t.into(), attention_mask_t.into()))?;

            let output = result
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("No output tensor"))?;
            let view = output
                .to_array_view::<f32>()
                .map_err(|e| anyhow::anyhow!("Output to array: {}", e))?;

            // Output shape is [batch, seq_len, dims] (last_hidden_state, mean-pool
            // over valid tokens) or [batch, dims] (sentence_embedding). Handle both.
            let shape = view.shape();
            if shape.len() == 2 {
                for i in 0..shape[0] {
                    let row = view.slice(ndarray::s![i, ..]);
                    let vec: Vec<f32> = row.iter().copied().collect();
                    all_embeddings.push(normalize_l2(vec));
                }
            } else if shape.len() == 3 {
                let seq_len = shape[1];
                for (i, enc) in encodings.iter().enumerate() {
                    let valid_len = enc.get_ids().len().min(seq_len).min(max_len);
                    let mut sum = vec![0f32; loaded.dims];
                    let mut count = 0f32;
                    for j in 0..valid_len {
                        for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().enumerate() {
                            if k < loaded.dims {
                                sum[k] += v;
                            }
                        }
                        count += 1.0;
                    }
                    if count > 0.0 {
                        for x in &mut sum {
                            *x /= count;
                        }
                    }
                    all_embeddings.push(normalize_l2(sum));
                }
            } else {
                bail!("Unexpected output shape: {:?}", shape);
            }
        }

        Ok(all_embeddings)
    }
}

/// Model manifest: name -> (onnx path in repo, tokenizer path in repo, dims).
fn model_manifest(model_name: &str) -> Result<(&'static str, &'static str, usize)> {
    match model_name {
        "all-minilm-l6-v2" => Ok(("onnx/model.onnx", "tokenizer.json", ALL_MINILM_DIMS)),
        _ => bail!(
            "Tract backend supports only all-minilm-l6-v2 for now. Requested: '{}'",
            model_name
        ),
    }
}

fn download_to_cache(repo: &str, path: &str, cache_path: &std::path::Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!(
        "https://huggingface.co/{}/resolve/main/{}",
        repo,
        path.replace(' ', "%20")
    );
    let resp = reqwest::blocking::get(&url)
        .map_err(|e| anyhow::anyhow!("Download {}: {}", url, e))?
        .error_for_status()
        .map_err(|e| anyhow::anyhow!("Download {}: {}", url, e))?;
    let bytes = resp
        .bytes()
        .map_err(|e| anyhow::anyhow!("Read body: {}", e))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Create cache parent: {}", e))?;
    }
    std::fs::write(cache_path, &bytes).map_err(|e| anyhow::anyhow!("Write cache: {}", e))?;
    Ok(())
}
