//! Response confidence estimation
//!
//! A pure heuristic over the response text and the serving model: start
//! from a model-class prior, subtract for hedging and brevity, add for
//! structure, clamp to [0, 1]. Same inputs, same score.

use inference_fabric_router::parametric_size_billions;
use serde::{Deserialize, Serialize};

/// Closed marker set; case-insensitive substring occurrences each cost
/// 0.08 down to a floor of -0.4.
const UNCERTAINTY_MARKERS: &[&str] = &[
    "i don't know",
    "i'm not sure",
    "it depends",
    "as an ai",
    "i cannot",
    "unclear",
    "might be",
    "possibly",
    "maybe",
    "i think",
    "not certain",
    "hard to say",
    "in general",
    "typically",
    "approximately",
];

const UNCERTAINTY_PENALTY_PER_HIT: f64 = 0.08;
const UNCERTAINTY_FLOOR: f64 = 0.4;
const SHORT_RESPONSE_CHARS: usize = 20;
const LONG_RESPONSE_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceEstimate {
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Prior by model parametric size: small 0.55, mid 0.7, large 0.85
fn model_prior(model: &str) -> (f64, &'static str) {
    match parametric_size_billions(model) {
        Some(size) if size >= 13.0 => (0.85, "large model prior"),
        Some(size) if size >= 4.0 => (0.70, "mid model prior"),
        _ => (0.55, "small model prior"),
    }
}

fn lexical_diversity(text: &str) -> f64 {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let unique: std::collections::HashSet<String> =
        words.iter().map(|w| w.to_lowercase()).collect();
    unique.len() as f64 / words.len() as f64
}

fn has_structured_output(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    let list_lines = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("- ")
                || trimmed.starts_with("* ")
                || trimmed
                    .split_once('.')
                    .map(|(head, _)| head.chars().all(|c| c.is_ascii_digit()) && !head.is_empty())
                    .unwrap_or(false)
        })
        .count();
    list_lines >= 2
}

fn has_numeric_answer(text: &str) -> bool {
    text.split_whitespace().any(|word| {
        let cleaned = word.trim_matches(|c: char| c.is_ascii_punctuation());
        !cleaned.is_empty() && cleaned.chars().all(|c| c.is_ascii_digit() || c == '.')
            && cleaned.chars().any(|c| c.is_ascii_digit())
    })
}

/// Score a completed response. Pure; no clocks, no randomness.
pub fn estimate_confidence(text: &str, model: &str) -> ConfidenceEstimate {
    let (prior, prior_reason) = model_prior(model);
    let mut score = prior;
    let mut reasons = vec![prior_reason.to_string()];

    let length = text.chars().count();
    if length < SHORT_RESPONSE_CHARS {
        score -= 0.3;
        reasons.push(format!("very short response ({} chars)", length));
    } else if length > LONG_RESPONSE_CHARS && lexical_diversity(text) < 0.3 {
        score -= 0.1;
        reasons.push("long response with low lexical diversity".to_string());
    }

    let lower = text.to_lowercase();
    let hits: usize = UNCERTAINTY_MARKERS
        .iter()
        .map(|marker| lower.matches(marker).count())
        .sum();
    if hits > 0 {
        let penalty = (hits as f64 * UNCERTAINTY_PENALTY_PER_HIT).min(UNCERTAINTY_FLOOR);
        score -= penalty;
        reasons.push(format!("{} uncertainty markers (-{:.2})", hits, penalty));
    }

    let mut quality_bonus: f64 = 0.0;
    if has_structured_output(text) {
        quality_bonus += 0.1;
        reasons.push("structured output".to_string());
    }
    if has_numeric_answer(text) {
        quality_bonus += 0.1;
        reasons.push("numeric answer".to_string());
    }
    score += quality_bonus.min(0.2);

    ConfidenceEstimate {
        score: score.clamp(0.0, 1.0),
        reasons,
    }
}
