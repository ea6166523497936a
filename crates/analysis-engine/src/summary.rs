//! Prompt construction for the narrative summary stage

use serde_json::{Map, Value};
use std::fmt::Write;

const INSTRUCTIONS: &str = "You are an equity research assistant. Using only the analysis \
results below, write a concise investment summary covering trend, valuation, sentiment \
and key risks. End with an overall outlook of bullish, neutral or bearish.";

/// Build the summary prompt from per-stage analysis outputs
///
/// Stages appear in the order they ran.
pub fn build_summary_prompt(instrument: &str, analyses: &Map<String, Value>) -> String {
    let mut prompt = String::with_capacity(256);
    prompt.push_str(INSTRUCTIONS);
    let _ = write!(prompt, "\n\nInstrument: {instrument}\n");

    if analyses.is_empty() {
        prompt.push_str("\nNo analysis results are available.\n");
        return prompt;
    }

    for (stage, output) in analyses {
        let body = serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string());
        let _ = write!(prompt, "\n## {stage}\n{body}\n");
    }
    prompt
}
