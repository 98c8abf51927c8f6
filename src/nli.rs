//! Natural-language-inference classification over fragment pairs.
//!
//! Two serving modes: a remote HTTP endpoint (`POST /classify`) with a short
//! timeout, or an in-process quantised multilingual cross-encoder served via
//! ONNX Runtime. The local model loads once into a singleton; a failed load
//! sets a permanent flag so every later call short-circuits to `None` and the
//! consolidator falls through to the LLM or the pending queue.
//!
//! [`detect_contradiction`] layers the fixed threshold table on top of the
//! raw label distribution.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::warn;

use crate::config::NliConfig;

/// Softmax distribution over the three NLI labels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NliScores {
    pub entailment: f64,
    pub neutral: f64,
    pub contradiction: f64,
}

/// One classification: argmax label plus the full distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NliClassification {
    pub label: String,
    pub scores: NliScores,
}

/// Verdict from the thresholded contradiction detector.
#[derive(Debug, Clone, Copy)]
pub struct ContradictionVerdict {
    pub contradicts: bool,
    pub confidence: f64,
    /// The pair is ambiguous enough to hand to the LLM (or the pending queue).
    pub needs_escalation: bool,
    pub scores: NliScores,
}

/// NLI serving mode.
enum Mode {
    Remote {
        http: reqwest::blocking::Client,
        endpoint: String,
    },
    Local {
        cache_dir: std::path::PathBuf,
    },
    Disabled,
}

pub struct NliClassifier {
    mode: Mode,
}

impl NliClassifier {
    pub fn from_config(config: &NliConfig) -> Result<Self> {
        let mode = match config.mode.as_str() {
            "remote" => Mode::Remote {
                http: reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(config.timeout_secs))
                    .build()
                    .context("failed to build NLI HTTP client")?,
                endpoint: format!("{}/classify", config.endpoint.trim_end_matches('/')),
            },
            "local" => Mode::Local {
                cache_dir: crate::config::expand_tilde(&config.cache_dir),
            },
            "none" => Mode::Disabled,
            other => anyhow::bail!("unknown nli mode: {other}. Supported: local, remote, none"),
        };
        Ok(Self { mode })
    }

    /// A classifier that always returns `None`.
    pub fn disabled() -> Self {
        Self {
            mode: Mode::Disabled,
        }
    }

    /// Classify a (premise, hypothesis) pair. Any failure — network, load,
    /// inference — returns `None`; callers treat that as "NLI unavailable".
    pub fn classify(&self, premise: &str, hypothesis: &str) -> Option<NliClassification> {
        match &self.mode {
            Mode::Disabled => None,
            Mode::Remote { http, endpoint } => {
                match classify_remote(http, endpoint, premise, hypothesis) {
                    Ok(result) => Some(result),
                    Err(e) => {
                        warn!(error = %e, "remote NLI call failed");
                        None
                    }
                }
            }
            Mode::Local { cache_dir } => {
                let model = local_model(cache_dir)?;
                match model.classify(premise, hypothesis) {
                    Ok(result) => Some(result),
                    Err(e) => {
                        warn!(error = %e, "local NLI inference failed");
                        None
                    }
                }
            }
        }
    }

    /// Classify and apply the contradiction threshold table. `None` when the
    /// classifier itself is unavailable.
    pub fn detect_contradiction(&self, a: &str, b: &str) -> Option<ContradictionVerdict> {
        self.classify(a, b).map(|c| verdict_from_scores(c.scores))
    }
}

/// The fixed threshold table, first match wins.
pub fn verdict_from_scores(scores: NliScores) -> ContradictionVerdict {
    let (contradicts, confidence, needs_escalation) = if scores.contradiction >= 0.8 {
        (true, scores.contradiction, false)
    } else if scores.entailment >= 0.6 {
        (false, scores.entailment, false)
    } else if scores.contradiction >= 0.5 {
        (true, scores.contradiction, true)
    } else if scores.contradiction >= 0.2 {
        (false, scores.contradiction, true)
    } else {
        (false, scores.contradiction, false)
    };

    ContradictionVerdict {
        contradicts,
        confidence,
        needs_escalation,
        scores,
    }
}

fn classify_remote(
    http: &reqwest::blocking::Client,
    endpoint: &str,
    premise: &str,
    hypothesis: &str,
) -> Result<NliClassification> {
    let response = http
        .post(endpoint)
        .json(&serde_json::json!({
            "premise": premise,
            "hypothesis": hypothesis,
        }))
        .send()
        .context("NLI request failed")?;

    anyhow::ensure!(
        response.status().is_success(),
        "NLI endpoint returned HTTP {}",
        response.status()
    );

    response.json().context("failed to parse NLI response")
}

// ── Local ONNX cross-encoder ──────────────────────────────────────────────────

/// One-shot singleton. `None` inside means the load failed permanently.
static LOCAL_MODEL: OnceLock<Option<Arc<LocalNliModel>>> = OnceLock::new();

fn local_model(cache_dir: &Path) -> Option<Arc<LocalNliModel>> {
    LOCAL_MODEL
        .get_or_init(|| match LocalNliModel::load(cache_dir) {
            Ok(model) => Some(Arc::new(model)),
            Err(e) => {
                warn!(error = %e, "NLI model load failed — all NLI calls will return None");
                None
            }
        })
        .clone()
}

/// In-process multilingual NLI cross-encoder (premise ⊕ hypothesis → 3 logits).
struct LocalNliModel {
    session: Mutex<ort::session::Session>,
    tokenizer: tokenizers::Tokenizer,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex.
unsafe impl Send for LocalNliModel {}
unsafe impl Sync for LocalNliModel {}

/// Maximum sequence length for the pair encoding.
const MAX_SEQ_LEN: usize = 256;

impl LocalNliModel {
    fn load(cache_dir: &Path) -> Result<Self> {
        let model_path = cache_dir.join("nli.onnx");
        let tokenizer_path = cache_dir.join("nli-tokenizer.json");

        anyhow::ensure!(
            model_path.exists(),
            "NLI model not found at {}. Run `mnemon model download` first.",
            model_path.display()
        );
        anyhow::ensure!(
            tokenizer_path.exists(),
            "NLI tokenizer not found at {}. Run `mnemon model download` first.",
            tokenizer_path.display()
        );

        let session = ort::session::Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(&model_path)
            .context("failed to load NLI ONNX model")?;

        let mut tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load NLI tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;

        tracing::info!(model = %model_path.display(), "NLI model loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }

    fn classify(&self, premise: &str, hypothesis: &str) -> Result<NliClassification> {
        let encoding = self
            .tokenizer
            .encode((premise, hypothesis), true)
            .map_err(|e| anyhow::anyhow!("pair tokenization failed: {e}"))?;

        let seq_len = encoding.get_ids().len();
        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();

        let shape = vec![1i64, seq_len as i64];
        let input_ids_tensor =
            ort::value::Tensor::from_array((shape.clone(), input_ids.into_boxed_slice()))?;
        let attention_mask_tensor =
            ort::value::Tensor::from_array((shape, attention_mask.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;

        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor,
        })?;

        let (dims, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("failed to extract NLI logits")?;
        let dims: &[i64] = &dims;
        anyhow::ensure!(
            dims.len() == 2 && dims[1] == 3,
            "unexpected NLI logits shape: {dims:?}, expected [1, 3]"
        );

        // Label order for XNLI-format heads: entailment, neutral, contradiction
        let scores = softmax3(data[0] as f64, data[1] as f64, data[2] as f64);
        Ok(NliClassification {
            label: argmax_label(&scores).to_string(),
            scores,
        })
    }
}

fn softmax3(a: f64, b: f64, c: f64) -> NliScores {
    let max = a.max(b).max(c);
    let (ea, eb, ec) = ((a - max).exp(), (b - max).exp(), (c - max).exp());
    let sum = ea + eb + ec;
    NliScores {
        entailment: ea / sum,
        neutral: eb / sum,
        contradiction: ec / sum,
    }
}

fn argmax_label(scores: &NliScores) -> &'static str {
    if scores.contradiction >= scores.entailment && scores.contradiction >= scores.neutral {
        "contradiction"
    } else if scores.entailment >= scores.neutral {
        "entailment"
    } else {
        "neutral"
    }
}
