//! Prompt complexity classification
//!
//! A pure, deterministic function of prompt text and model name. The
//! marker sets are closed; matching is case-insensitive substring.

use serde::{Deserialize, Serialize};

/// Complexity tiers, orderable so a large model can upgrade one step
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityTier {
    fn upgraded(self) -> ComplexityTier {
        match self {
            ComplexityTier::Simple => ComplexityTier::Moderate,
            ComplexityTier::Moderate => ComplexityTier::Complex,
            ComplexityTier::Complex => ComplexityTier::Complex,
        }
    }
}

const SIMPLE_MARKERS: &[&str] = &[
    "what is",
    "who is",
    "when was",
    "where is",
    "yes or no",
    "true or false",
    "briefly",
    "in short",
    "one sentence",
];

const COMPLEX_MARKERS: &[&str] = &[
    "write a detailed",
    "explain in depth",
    "analyze",
    "compare and contrast",
    "generate code",
    "create a comprehensive",
    "write an essay",
    "compose",
    "develop a plan",
];

const SHORT_PROMPT_CHARS: usize = 50;
const LONG_PROMPT_CHARS: usize = 800;

/// Parametric size in billions from a model tag like `llama3:8b` or
/// `qwen2.5:1.5b-instruct`. None when the name carries no size.
pub fn parametric_size_billions(model: &str) -> Option<f64> {
    let tag = model.split(':').nth(1)?.to_lowercase();
    let end = tag.find('b')?;
    tag[..end].parse::<f64>().ok().filter(|size| *size > 0.0)
}

/// Classify a prompt for the routing fabric
pub fn classify(prompt: &str, model: &str) -> ComplexityTier {
    let lower = prompt.to_lowercase();
    let length = prompt.chars().count();

    let base = if SIMPLE_MARKERS.iter().any(|m| lower.contains(m)) {
        ComplexityTier::Simple
    } else if length >= LONG_PROMPT_CHARS
        || COMPLEX_MARKERS.iter().any(|m| lower.contains(m))
    {
        ComplexityTier::Complex
    } else if length < SHORT_PROMPT_CHARS {
        ComplexityTier::Simple
    } else {
        ComplexityTier::Moderate
    };

    // A 7B+ model makes any prompt one step more expensive to serve
    match parametric_size_billions(model) {
        Some(size) if size >= 7.0 => base.upgraded(),
        _ => base,
    }
}

/// A declared latency-critical flag is unjustified on a SIMPLE prompt;
/// policy may then treat the caller's target as a hint. Uses the same
/// model-aware classification the router scores with.
pub fn should_allow_latency_critical(prompt: &str, model: &str, declared_critical: bool) -> bool {
    !(declared_critical && classify(prompt, model) == ComplexityTier::Simple)
}
