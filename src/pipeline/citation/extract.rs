//! Pattern-based citation extraction. No model call, no I/O.
//!
//! Deliberately over-inclusive: anything citation-shaped is reported and the
//! verifier sorts out false positives.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::types::{Citation, CitationKind};

macro_rules! party {
    () => {
        r"[A-Z][\w'&.\-]*(?:\s+(?:[A-Z][\w'&.\-]*|of|and|the|for|de|la|plc|ltd|&))*"
    };
}

/// `Party v Party [year] (volume) Report number`
static CASE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        party!(),
        r"\s+(?:v|vs|V)\.?\s+",
        party!(),
        r",?\s*[\[(]\d{4}[\])]",
        r"(?:\s+\d{1,4})?",
        r"\s+[A-Z][A-Za-z.]*(?:\s+[A-Z][A-Za-z.]*)*",
        r"\s+\d+",
    ))
    .expect("case citation pattern")
});

/// `Name Act year (jurisdiction) s section`
static LEGISLATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"[A-Z][\w'\-]*(?:\s+(?:[A-Z][\w'\-]*|of|and|the|for|to|on|in|&))*\s+Act",
        r"\s+\d{4}",
        r"(?:\s*\([A-Za-z][A-Za-z.\s]{0,20}\))?",
        r"(?:,?\s+(?:section|sec\.|ss?\.|s)\s*\d+[A-Za-z]?(?:\([0-9A-Za-z]+\))*)?",
    ))
    .expect("legislation citation pattern")
});

/// Bare neutral or report citation: `[2019] EWCA Civ 123`, `(1992) 175 CLR 1`.
static NEUTRAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\[(]\d{4}[\])]\s+(?:\d{1,4}\s+)?[A-Z][A-Za-z]*(?:\s+[A-Z][A-Za-z]*)*\s+\d+")
        .expect("neutral citation pattern")
});

/// Sentence-level words that get swept into a leading party or act name.
const LEADING_NOISE: &[&str] = &[
    "under", "see", "in", "by", "per", "and", "of", "pursuant", "to", "also", "cf", "as", "at",
    "with", "from", "following", "applying",
];

/// Find citation-shaped substrings in `text`.
///
/// Overlapping matches keep the earlier, longer one. Citations with the same
/// normalized form are reported once, at their first occurrence.
pub fn extract(text: &str) -> Vec<Citation> {
    let mut found: Vec<(usize, usize, CitationKind)> = Vec::new();

    for m in CASE_PATTERN.find_iter(text) {
        let start = strip_leading_noise(text, m.start(), m.end(), false);
        found.push((start, m.end(), CitationKind::Case));
    }
    for m in LEGISLATION_PATTERN.find_iter(text) {
        let start = strip_leading_noise(text, m.start(), m.end(), true);
        found.push((start, m.end(), CitationKind::Legislation));
    }
    for m in NEUTRAL_PATTERN.find_iter(text) {
        found.push((m.start(), m.end(), CitationKind::Unknown));
    }

    found.sort_by(|a, b| a.0.cmp(&b.0).then((b.1 - b.0).cmp(&(a.1 - a.0))));

    let mut citations = Vec::new();
    let mut seen = HashSet::new();
    let mut covered_to = 0;

    for (start, end, kind) in found {
        if start < covered_to {
            continue;
        }
        covered_to = end;

        let raw_text = &text[start..end];
        let normalized_form = normalize(raw_text);
        if !seen.insert(normalized_form.clone()) {
            continue;
        }
        citations.push(Citation {
            raw_text: raw_text.to_string(),
            normalized_form,
            kind,
            span: start..end,
        });
    }

    citations
}

/// Canonical form used for dedup and authority queries. Idempotent.
///
/// Collapses whitespace, rewrites `v.`/`vs`/`vs.`/`V` to `v` and
/// `section`/`sec.`/`s.` to `s`, and strips trailing punctuation.
pub fn normalize(raw: &str) -> String {
    const TRAILING: &[char] = &['.', ',', ';', ':'];

    let tokens: Vec<&str> = raw
        .split_whitespace()
        .map(|token| match token.trim_end_matches(TRAILING) {
            "v" | "V" | "vs" | "Vs" => "v",
            "section" | "Section" | "sec" | "Sec" | "s" => "s",
            _ => token,
        })
        .collect();

    tokens
        .join(" ")
        .trim_end_matches(|c: char| TRAILING.contains(&c) || c.is_whitespace())
        .to_string()
}

/// Move `start` past sentence words the greedy name patterns swallowed,
/// e.g. "See Donoghue v ..." or "Pursuant to the Limitation Act ...".
fn strip_leading_noise(text: &str, start: usize, end: usize, allow_article: bool) -> usize {
    let is_noise = |w: &str| {
        let lower = w.to_lowercase();
        LEADING_NOISE.contains(&lower.as_str()) || (allow_article && lower == "the")
    };

    let mut offset = start;
    loop {
        let rest = &text[offset..end];
        let mut words = rest.split_whitespace();
        let (Some(first), Some(second)) = (words.next(), words.next()) else {
            break;
        };
        if !is_noise(first) || matches!(second, "v" | "V" | "vs" | "v." | "Act") {
            break;
        }
        if !(second.starts_with(char::is_uppercase) || is_noise(second)) {
            break;
        }
        let after_first = &rest[first.len()..];
        offset += first.len() + (after_first.len() - after_first.trim_start().len());
    }
    offset
}
