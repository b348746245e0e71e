use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sift_core::config::OutputLimits;
use sift_core::graph::SynthesisInstructions;
use sift_core::traits::InferenceService;
use sift_core::types::{
    CancelReason, CostMetadata, ExecutionReport, ExecutionStatus, InferenceRequest, NodeResult, Payload,
};
use sift_strategies::util::truncate_chars;

use crate::tokens::{estimate_tokens, truncate_to_tokens};

const SYSTEM_PROMPT: &str = "\
You answer the user's question using only the findings you are given. \
Write plain prose or a short list. Never show identifiers, JSON or code blocks. \
If some information is listed as missing, mention it briefly and never invent it.";

const APOLOGY: &str = "Sorry, I couldn't retrieve the information needed to answer that.";

const PARTIAL_CANCELLED: &str =
    "This answer is partial: the request was cancelled before every step finished.";
const PARTIAL_DEADLINE: &str =
    "This answer is partial: the request ran out of time before every step finished.";
const PARTIAL_UNWRITTEN: &str =
    "This answer is partial: the request ran out of time before a full answer could be written.";

/// Something the answer cannot cover, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    pub description: String,
    pub reason: String,
}

/// The final answer for one request.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub text: String,
    pub cost: CostMetadata,
    /// The model call failed and the answer was built from the digest.
    pub used_fallback: bool,
    /// Execution was interrupted; the answer covers only part of the plan.
    pub partial: bool,
}

/// Turns an execution report into one bounded natural-language answer.
pub struct Synthesizer {
    inference: Arc<dyn InferenceService>,
    limits: OutputLimits,
}

impl Synthesizer {
    pub fn new(inference: Arc<dyn InferenceService>, limits: OutputLimits) -> Self {
        Self { inference, limits }
    }

    pub async fn synthesize(
        &self,
        query: &str,
        instructions: &SynthesisInstructions,
        report: &ExecutionReport,
    ) -> Synthesis {
        self.write(query, instructions, report, None).await
    }

    /// Like `synthesize`, but the model call must finish before `deadline`.
    /// Past it the answer is built from the digest and marked partial.
    pub async fn synthesize_before(
        &self,
        query: &str,
        instructions: &SynthesisInstructions,
        report: &ExecutionReport,
        deadline: Instant,
    ) -> Synthesis {
        self.write(query, instructions, report, Some(deadline)).await
    }

    async fn write(
        &self,
        query: &str,
        instructions: &SynthesisInstructions,
        report: &ExecutionReport,
        deadline: Option<Instant>,
    ) -> Synthesis {
        let partial = report.is_cancelled();
        let note = gap_note(report);

        if report.useful_count() == 0 {
            info!("No usable results, answering with an apology");
            return Synthesis {
                text: self.finish(APOLOGY, &note),
                cost: CostMetadata::default(),
                used_fallback: false,
                partial,
            };
        }

        let digest = digest(report, self.limits.synthesis_input_tokens);
        let prompt = self.build_prompt(query, instructions, &digest, report);
        debug!(digest_tokens = estimate_tokens(&digest), "Synthesizing answer");

        let request = InferenceRequest::text(prompt, self.limits.synthesis_max_output_tokens)
            .with_system(SYSTEM_PROMPT);
        let mut cost = CostMetadata::default();
        let reply = match deadline {
            Some(deadline) => tokio::select! {
                reply = self.inference.infer(request) => Some(reply),
                _ = tokio::time::sleep_until(deadline) => None,
            },
            None => Some(self.inference.infer(request).await),
        };
        let Some(reply) = reply else {
            warn!("Synthesis call outlived the pipeline deadline, using fallback");
            let note = if partial {
                note
            } else {
                note_with(report, Some(PARTIAL_UNWRITTEN))
            };
            return Synthesis {
                text: self.finish(&fallback_body(&digest), &note),
                cost,
                used_fallback: true,
                partial: true,
            };
        };
        match reply {
            Ok(response) => {
                cost.record_inference(&response);
                let body = sanitize(&response.text);
                if body.is_empty() {
                    warn!("Synthesis reply was empty after cleanup, using fallback");
                    return Synthesis {
                        text: self.finish(&fallback_body(&digest), &note),
                        cost,
                        used_fallback: true,
                        partial,
                    };
                }
                Synthesis {
                    text: self.finish(&body, &note),
                    cost,
                    used_fallback: false,
                    partial,
                }
            }
            Err(e) => {
                warn!(error = %e, "Synthesis call failed, using fallback");
                Synthesis {
                    text: self.finish(&fallback_body(&digest), &note),
                    cost,
                    used_fallback: true,
                    partial,
                }
            }
        }
    }

    /// Answer used when nothing could be retrieved at all.
    pub fn apology(&self, report: &ExecutionReport) -> String {
        self.finish(APOLOGY, &gap_note(report))
    }

    fn build_prompt(
        &self,
        query: &str,
        instructions: &SynthesisInstructions,
        digest: &str,
        report: &ExecutionReport,
    ) -> String {
        let mut prompt = format!("## Question\n{}\n\n## What to cover\n", query.trim());
        if instructions.focus.is_empty() {
            prompt.push_str("Answer the question directly.\n");
        } else {
            prompt.push_str(&format!("{}\n", instructions.focus));
        }
        if let Some(ref format) = instructions.format {
            prompt.push_str(&format!("Format: {}\n", format));
        }
        for note in &instructions.notes {
            prompt.push_str(&format!("- {}\n", note));
        }
        prompt.push_str("\n## Findings\n");
        prompt.push_str(digest);

        let gaps = gaps(report);
        if !gaps.is_empty() {
            prompt.push_str("\n## Missing\n");
            for gap in &gaps {
                prompt.push_str(&format!("- {}: {}\n", gap.description, gap.reason));
            }
        }
        if report.is_cancelled() {
            prompt.push_str("\nThe request was interrupted, so this is a partial answer.\n");
        }
        prompt.push_str(&format!(
            "\nAnswer in at most {} characters.",
            self.limits.max_response_chars
        ));
        prompt
    }

    /// Join body and gap note within `max_response_chars`. The note is kept whole
    /// whenever it fits on its own.
    fn finish(&self, body: &str, note: &str) -> String {
        let max = self.limits.max_response_chars;
        if note.is_empty() {
            return bound(body, max);
        }
        let note_len = note.chars().count();
        if note_len + 2 >= max {
            return bound(note, max);
        }
        let body = bound(body.trim(), max - note_len - 2);
        if body.is_empty() {
            return note.to_string();
        }
        format!("{}\n\n{}", body, note)
    }
}

/// Truncate to at most `max` chars, counting the ellipsis.
fn bound(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    truncate_chars(text, max - 1)
}

fn ordered(report: &ExecutionReport) -> Vec<&NodeResult> {
    let mut results: Vec<&NodeResult> = report.results.values().collect();
    results.sort_by(|a, b| (a.stage, &a.node_id).cmp(&(b.stage, &b.node_id)));
    results
}

/// Everything the answer cannot cover, in plan order.
pub fn gaps(report: &ExecutionReport) -> Vec<Gap> {
    let mut out = Vec::new();
    for result in ordered(report) {
        match (&result.error, &result.payload) {
            (Some(error), _) => out.push(Gap {
                description: result.description.clone(),
                reason: error.reason(),
            }),
            (
                None,
                Some(Payload::Analysis {
                    failed,
                    skipped,
                    total,
                    ..
                }),
            ) if !failed.is_empty() || *skipped > 0 => {
                let mut reasons = Vec::new();
                if !failed.is_empty() {
                    reasons.push(format!("{} of {} items could not be read", failed.len(), total));
                }
                if *skipped > 0 {
                    reasons.push(format!("{} of {} items were over the limit and not read", skipped, total));
                }
                out.push(Gap {
                    description: result.description.clone(),
                    reason: reasons.join("; "),
                })
            }
            _ => {}
        }
    }
    out
}

/// Deterministic closing note naming every gap. Empty when nothing is missing.
pub fn gap_note(report: &ExecutionReport) -> String {
    let headline = match report.status {
        ExecutionStatus::Cancelled {
            reason: CancelReason::Signal,
        } => Some(PARTIAL_CANCELLED),
        ExecutionStatus::Cancelled {
            reason: CancelReason::Deadline,
        } => Some(PARTIAL_DEADLINE),
        _ => None,
    };
    note_with(report, headline)
}

fn note_with(report: &ExecutionReport, headline: Option<&str>) -> String {
    let mut lines = Vec::new();
    if let Some(headline) = headline {
        lines.push(headline.to_string());
    }
    let gaps = gaps(report);
    if !gaps.is_empty() {
        lines.push("Not included:".to_string());
        for gap in gaps {
            // Descriptions come from the planner and may echo identifiers.
            lines.push(sanitize(&format!("- {}: {}.", gap.description, gap.reason)));
        }
    }
    lines.join("\n")
}

/// Compact findings of every useful node, trimmed to `budget_tokens`.
///
/// The budget is shared evenly; each section is cut to its share.
pub fn digest(report: &ExecutionReport, budget_tokens: usize) -> String {
    let useful: Vec<&NodeResult> = ordered(report).into_iter().filter(|r| r.is_useful()).collect();
    if useful.is_empty() {
        return String::new();
    }
    let share = (budget_tokens / useful.len()).max(1);
    let mut out = String::new();
    for result in useful {
        let body = result
            .payload
            .as_ref()
            .map(Payload::render_compact)
            .unwrap_or_default();
        let section = format!("### {}\n{}", result.description, body);
        let cut = truncate_to_tokens(&section, share);
        out.push_str(cut);
        if cut.len() < section.len() {
            out.push_str("…\n");
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn fallback_body(digest: &str) -> String {
    let findings: String = digest
        .lines()
        .map(|line| match line.strip_prefix("### ") {
            Some(heading) => format!("{}:", heading),
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n");
    sanitize(&format!("Here is what I found.\n\n{}", findings))
}

enum RuleKind {
    Remove,
    /// Remove only tokens mixing letters and digits.
    RemoveMixed,
}

struct Rule {
    re: Regex,
    kind: RuleKind,
}

const RULES: &[(&str, bool)] = &[
    // Fenced code blocks.
    (r"(?s)```.*?```", false),
    // Flat JSON objects, e.g. {"id": "x"}.
    (r#"\{[^{}]*"[^"{}]*"\s*:[^{}]*\}"#, false),
    (r"\[\s*\]|\{\s*\}", false),
    (r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b", false),
    (r"(?i)\b(?:evt|msg|thr|thread|event|message|acct|id)[_-][a-z]*\d[a-z0-9]*\b", false),
    (r"\b[A-Za-z0-9_]{12,}\b", true),
];

fn rules() -> &'static [Rule] {
    static COMPILED: OnceLock<Vec<Rule>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|(pattern, mixed)| match Regex::new(pattern) {
                Ok(re) => Some(Rule {
                    re,
                    kind: if *mixed { RuleKind::RemoveMixed } else { RuleKind::Remove },
                }),
                Err(e) => {
                    warn!(pattern, error = %e, "Invalid sanitizer pattern");
                    None
                }
            })
            .collect()
    })
}

fn tidy() -> &'static [(Regex, &'static str)] {
    static TIDY: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    TIDY.get_or_init(|| {
        [
            (r"\(\s*[,;]?\s*\)", ""),
            (r"[ \t]+([,.;:])", "$1"),
            (r"[ \t]{2,}", " "),
            (r"[ \t]+\n", "\n"),
            (r"\n{3,}", "\n\n"),
        ]
        .into_iter()
        .filter_map(|(p, rep)| Regex::new(p).ok().map(|re| (re, rep)))
        .collect()
    })
}

/// Strip structured artifacts from model output: code fences, JSON
/// objects and opaque identifiers.
pub fn sanitize(text: &str) -> String {
    let mut out = text.to_string();
    for rule in rules() {
        out = match rule.kind {
            RuleKind::Remove => rule.re.replace_all(&out, "").into_owned(),
            RuleKind::RemoveMixed => rule
                .re
                .replace_all(&out, |caps: &regex::Captures| {
                    let token = &caps[0];
                    let digits = token.chars().any(|c| c.is_ascii_digit());
                    let letters = token.chars().any(|c| c.is_ascii_alphabetic());
                    if digits && letters {
                        String::new()
                    } else {
                        token.to_string()
                    }
                })
                .into_owned(),
        };
    }
    for (re, rep) in tidy() {
        out = re.replace_all(&out, *rep).into_owned();
    }
    out.trim().to_string()
}
