//! Per-aspect instructions and answer parsing.
//!
//! Each aspect is asked with its own system message so the answers stay
//! focused; list aspects are asked for a JSON array but bullet lists are
//! accepted too.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{Aspect, Chunk, ExtractedContent};

const PREAMBLE: &str = "You are a meticulous research assistant reading one part of a \
scientific paper. Answer only from the text you are given. If the text contains nothing \
relevant, answer with the single word NONE.";

const SUMMARY_SYSTEM: &str = "You are a meticulous research assistant building a running \
summary of a scientific paper, one part at a time. Combine the summary so far with the new \
part into a single updated summary of the paper's problem, method, results and implications. \
Keep it under 400 words and answer with the summary text only.";

const SUMMARY_NONE: &str = "If there is no summary so far and the new part contains nothing \
about the paper's content, answer with the single word NONE.";

const TAKEAWAYS_SYSTEM: &str = "Extract the key takeaways of this part: contributions, findings \
and numerical results worth remembering. Answer with a JSON array of short strings.";

const MATH_SYSTEM: &str = "Extract the important mathematical formulations in this part \
(objectives, update rules, key definitions). Write each as one string containing the formula \
and a short explanation of its symbols. Answer with a JSON array of strings.";

const ARCHITECTURE_SYSTEM: &str = "Describe the model or system architecture presented in this \
part: components, layers, how data flows between them, and notable hyperparameters. Answer \
with a concise paragraph.";

const DOMAIN_SYSTEM: &str = "Name the specific research domain of this paper using standard \
terminology such as Natural Language Processing, Computer Vision, Reinforcement Learning, \
Graph Neural Networks or Generative Models. Answer with the domain name only.";

const FUTURE_SYSTEM: &str = "List the future research directions, open problems and \
limitations that this part suggests. Answer with a JSON array of short strings.";

/// System message for an aspect.
pub fn system_message(aspect: Aspect) -> String {
    let instruction = match aspect {
        Aspect::Summary => {
            return format!("{}\n\n{}", SUMMARY_SYSTEM, SUMMARY_NONE);
        }
        Aspect::Takeaways => TAKEAWAYS_SYSTEM,
        Aspect::Math => MATH_SYSTEM,
        Aspect::Architecture => ARCHITECTURE_SYSTEM,
        Aspect::Domain => DOMAIN_SYSTEM,
        Aspect::FutureDirections => FUTURE_SYSTEM,
    };
    format!("{}\n\n{}", PREAMBLE, instruction)
}

fn part_header(title: &str, chunk: &Chunk, total: usize) -> String {
    let mut header = format!("Paper: {}\nPart {} of {}", title, chunk.index + 1, total);
    if let Some(section) = &chunk.section {
        header.push_str(&format!(" (section: {})", section));
    }
    header
}

/// User prompt for one independent aspect of one chunk.
pub fn aspect_prompt(aspect: Aspect, title: &str, chunk: &Chunk, total: usize) -> String {
    format!(
        "{}\n\nExtract the {} from the text below.\n\n---\n{}\n---",
        part_header(title, chunk, total),
        aspect.as_str().replace('_', " "),
        chunk.text
    )
}

/// User prompt for one step of the rolling summary.
pub fn summary_prompt(title: &str, chunk: &Chunk, total: usize, accumulated: &str) -> String {
    let so_far = if accumulated.trim().is_empty() {
        "(nothing yet, this is the first part)"
    } else {
        accumulated
    };
    format!(
        "{}\n\nSummary so far:\n{}\n\nNew part:\n---\n{}\n---\n\nWrite the updated summary.",
        part_header(title, chunk, total),
        so_far,
        chunk.text
    )
}

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*(.*?)\s*```$").unwrap());

static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+").unwrap());

fn is_none_answer(answer: &str) -> bool {
    let bare = answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`');
    bare.eq_ignore_ascii_case("none") || bare.eq_ignore_ascii_case("n/a")
}

fn strip_fence(answer: &str) -> &str {
    let trimmed = answer.trim();
    CODE_FENCE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map_or(trimmed, |m| m.as_str())
}

fn parse_list(answer: &str) -> Vec<String> {
    let body = strip_fence(answer);

    if body.starts_with('[') {
        if let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(body) {
            return values
                .into_iter()
                .map(|value| match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty() && !is_none_answer(item))
                .collect();
        }
    }

    body.lines()
        .map(|line| BULLET.replace(line, "").trim().to_string())
        .filter(|item| !item.is_empty() && !is_none_answer(item))
        .collect()
}

/// Clean a domain answer down to a short label.
///
/// Quotes are stripped, only the first line is kept and verbose answers are
/// cut at the first comma or " and ".
pub fn clean_domain(answer: &str) -> String {
    let first_line = answer
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let mut domain = first_line
        .trim_start_matches("Domain:")
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '*' | '`' | '.'))
        .trim()
        .to_string();

    if domain.chars().count() > 50 {
        let cut = domain.split(',').next().unwrap_or("");
        let cut = cut.split(" and ").next().unwrap_or("");
        domain = cut.trim().to_string();
    }
    domain
}

/// Parse a model answer for `aspect`.
///
/// `Ok(ExtractedContent::Empty)` means the model found nothing relevant.
///
/// # Errors
/// Returns a description when the answer is unusable (blank, or a list
/// answer with no items).
pub fn parse_answer(aspect: Aspect, answer: &str) -> Result<ExtractedContent, String> {
    let trimmed = answer.trim();
    if trimmed.is_empty() {
        return Err("model returned an empty answer".to_string());
    }
    if is_none_answer(trimmed) {
        return Ok(ExtractedContent::Empty);
    }

    if aspect.is_list() {
        let items = parse_list(trimmed);
        return if items.is_empty() {
            Err(format!("no list items in answer: {:.80}", trimmed))
        } else {
            Ok(ExtractedContent::List(items))
        };
    }

    match aspect {
        Aspect::Domain => {
            let domain = clean_domain(trimmed);
            if domain.is_empty() {
                Err("blank domain answer".to_string())
            } else {
                Ok(ExtractedContent::Text(domain))
            }
        }
        _ => Ok(ExtractedContent::Text(strip_fence(trimmed).to_string())),
    }
}
