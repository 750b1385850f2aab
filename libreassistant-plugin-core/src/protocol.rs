//! # Protocol Codec Module
//!
//! Mediates between the language model and the orchestration core through a
//! strict structured protocol.
//!
//! Outbound, the codec produces a system instruction enumerating the running
//! plugins and the response schema the model must follow. Inbound, it parses
//! the model's text against that schema: lenient about *where* the JSON
//! document sits (raw, inside a fenced code block, or embedded in prose) but
//! strict about *what* it contains. A candidate is only accepted after full
//! schema validation. When nothing validates, the codec degrades explicitly:
//! the original text is returned as a `Message` with the compliance flag
//! cleared, never silently coerced into a plugin invocation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::supervisor::RunningPlugin;

fn default_markdown() -> bool {
    true
}

/// One structured reply from the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "content")]
pub enum AssistantReply {
    /// Final user-facing text; terminates the dispatch loop.
    #[serde(rename = "message")]
    Message {
        text: String,
        #[serde(default = "default_markdown")]
        markdown: bool,
    },
    /// Request to invoke a plugin with the given input.
    #[serde(rename = "plugin_invoke")]
    Invoke {
        plugin: String,
        input: Map<String, Value>,
        reason: String,
    },
}

/// Parse result: the reply plus whether the original text was
/// schema-compliant or had to be wrapped by the fallback path.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub reply: AssistantReply,
    pub schema_compliant: bool,
}

/// Serialise a reply back to its wire form.
pub fn serialize_reply(reply: &AssistantReply) -> String {
    // The enum shape cannot produce non-serialisable values.
    serde_json::to_string(reply).expect("reply serialisation cannot fail")
}

fn validate_candidate(candidate: &str) -> Option<AssistantReply> {
    let reply: AssistantReply = serde_json::from_str(candidate.trim()).ok()?;
    if let AssistantReply::Invoke { plugin, .. } = &reply {
        if plugin.is_empty() {
            return None;
        }
    }
    Some(reply)
}

/// Content of every ``` fenced block, in order of appearance.
///
/// A language tag on the opening fence (```json) is ignored.
fn fenced_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            match current.take() {
                Some(block) => blocks.push(block),
                None => current = Some(String::new()),
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }

    blocks
}

/// Substrings of `text` that form brace-balanced JSON objects.
///
/// Tracks string literals and escapes so braces inside strings do not
/// confuse the depth count. Candidates may span multiple lines.
fn balanced_candidates(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (i, &byte) in bytes[start..].iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match byte {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + i + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        match end {
            Some(end) => {
                candidates.push(&text[start..end]);
                search_from = end;
            }
            // Unbalanced tail; no further candidate can close.
            None => break,
        }
    }

    candidates
}

/// Parse a language-model response against the reply schema.
///
/// Attempts, in order: the raw text; each fenced code block; each
/// brace-balanced object embedded in the text. The first candidate passing
/// schema validation wins. On total failure the text is surfaced as a
/// non-compliant `Message`.
pub fn parse_reply(raw: &str) -> ParsedReply {
    if let Some(reply) = validate_candidate(raw) {
        return ParsedReply {
            reply,
            schema_compliant: true,
        };
    }

    for block in fenced_blocks(raw) {
        if let Some(reply) = validate_candidate(&block) {
            return ParsedReply {
                reply,
                schema_compliant: true,
            };
        }
    }

    for candidate in balanced_candidates(raw) {
        if let Some(reply) = validate_candidate(candidate) {
            return ParsedReply {
                reply,
                schema_compliant: true,
            };
        }
    }

    tracing::warn!(
        length = raw.len(),
        "language model response did not match the reply schema; falling back to plain message"
    );
    ParsedReply {
        reply: AssistantReply::Message {
            text: raw.to_string(),
            markdown: true,
        },
        schema_compliant: false,
    }
}

/// Build the per-turn system instruction.
///
/// Enumerates each running plugin's id, description and declared input
/// fields with a sample invocation, then states the response schema. The
/// plugin list is sorted by id so the prompt is deterministic for a given
/// running set.
pub fn build_system_prompt(running: &[RunningPlugin]) -> String {
    let mut prompt = String::from(
        "You are LibreAssistant, a privacy-first local assistant. \
         Respond with exactly one JSON document and nothing else. \
         To answer the user directly:\n\
         {\"action\":\"message\",\"content\":{\"text\":\"<your answer>\",\"markdown\":true}}\n\
         To invoke a plugin first:\n\
         {\"action\":\"plugin_invoke\",\"content\":{\"plugin\":\"<plugin id>\",\"input\":{...},\"reason\":\"<why>\"}}\n",
    );

    let mut plugins: Vec<&RunningPlugin> = running.iter().collect();
    plugins.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));

    if plugins.is_empty() {
        prompt.push_str("\nNo plugins are currently running; always use the message form.\n");
        return prompt;
    }

    prompt.push_str("\nRunning plugins:\n");
    for plugin in plugins {
        let descriptor = &plugin.descriptor;
        prompt.push_str(&format!(
            "- id: {}\n  description: {}\n",
            descriptor.id, descriptor.description
        ));
        if !descriptor.options.is_empty() {
            prompt.push_str("  input fields:\n");
            for (name, spec) in &descriptor.options {
                let kind = match spec.option_type {
                    crate::manifest::OptionType::String => "string",
                    crate::manifest::OptionType::Number => "number",
                    crate::manifest::OptionType::Boolean => "boolean",
                };
                prompt.push_str(&format!(
                    "    {} ({}{}){}\n",
                    name,
                    kind,
                    if spec.required { ", required" } else { "" },
                    spec.description
                        .as_deref()
                        .map(|d| format!(" - {d}"))
                        .unwrap_or_default(),
                ));
            }
        }
        prompt.push_str(&format!(
            "  example: {{\"action\":\"plugin_invoke\",\"content\":{{\"plugin\":\"{}\",\"input\":{{}},\"reason\":\"...\"}}}}\n",
            descriptor.id
        ));
    }

    prompt.push_str(
        "\nAfter a plugin result is provided, synthesise a user-facing answer with the \
         message form. Do not invoke the same plugin again with identical input.\n",
    );
    prompt
}

/// History turn carrying a plugin result back to the model.
///
/// Section markers delimit the payload so the model can tell tool output
/// from user text.
pub fn plugin_result_context(plugin_id: &str, result: &Value) -> String {
    format!(
        "[plugin result: {plugin_id}]\n{}\n[end plugin result]\n\
         Use this result to answer the user with the message form.",
        result
    )
}

/// History turn carrying a plugin failure back to the model.
pub fn plugin_error_context(plugin_id: &str, error: &str) -> String {
    format!(
        "[plugin error: {plugin_id}]\n{error}\n[end plugin error]\n\
         The invocation failed. Either try a different approach or explain the failure \
         to the user with the message form."
    )
}

/// History turn noting that a requested plugin is not running.
pub fn plugin_unavailable_note(plugin_id: &str) -> String {
    format!(
        "[system note] Plugin '{plugin_id}' is not running and cannot be invoked. \
         Answer with the message form or choose a running plugin."
    )
}
