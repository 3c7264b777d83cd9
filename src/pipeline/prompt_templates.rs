//! Prompt templates: opaque strings with declared `{{placeholder}}` slots.
//!
//! Template text is never interpreted beyond locating its placeholders.
//! Rendering substitutes every declared placeholder and fails if a value is
//! missing, so a template cannot silently lose part of its input.
//!
//! `PromptSet` holds the framing prompts the pipeline wraps around the
//! caller's task prompt. Every entry can be overridden at construction time.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("Unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("Invalid placeholder name: {0:?}")]
    InvalidName(String),

    #[error("No value supplied for placeholder {{{{{0}}}}}")]
    MissingValue(String),
}

// ═══════════════════════════════════════════════════════════
// PromptTemplate
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Result<Self, PromptError> {
        let source = source.into();
        let segments = parse(&source)?;
        Ok(Self { source, segments })
    }

    /// Declared placeholder names, in first-occurrence order.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn declares(&self, name: &str) -> bool {
        self.placeholders().contains(&name)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitute every declared placeholder. Extra values are ignored.
    pub fn render(&self, values: &[(&str, &str)]) -> Result<String, PromptError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = values
                        .iter()
                        .find(|(k, _)| *k == name.as_str())
                        .map(|(_, v)| *v)
                        .ok_or_else(|| PromptError::MissingValue(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse(source: &str) -> Result<Vec<Segment>, PromptError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or(PromptError::Unclosed(offset + open))?;
        let name = after_open[..close].trim();
        if !is_valid_name(name) {
            return Err(PromptError::InvalidName(name.to_string()));
        }
        segments.push(Segment::Placeholder(name.to_string()));

        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ═══════════════════════════════════════════════════════════
// Built-in framing prompts
// ═══════════════════════════════════════════════════════════

const CHUNK_SYSTEM: &str = "You are analysing one excerpt of a larger document set. \
Work only from the text inside this excerpt. Do not assume anything about \
text before or after it, and do not invent facts, names, dates or citations. \
If the excerpt contains nothing relevant to the task, say so briefly.";

const CHUNK_USER: &str = "{{task}}

Excerpt {{chunk_number}} of {{chunk_total}} (sources: {{sources}}).
<<<EXCERPT
{{excerpt}}
EXCERPT>>>{{grounding}}";

const CONSOLIDATION_SYSTEM: &str = "You merge partial analyses of consecutive \
excerpts into one coherent result. Use only facts present in the partial \
results. Never add facts, names, dates or citations that none of them contain.";

const CONSOLIDATION_USER: &str = "{{task}}

Below are {{partial_count}} partial results, one per excerpt, in document order.
Merge them into a single result in this format: {{target_format}}.
Deduplicate repeated facts, resolve ordering (chronologically where the content \
is time-based) and remove redundancy while preserving every distinct fact.

{{partials}}{{grounding}}{{feedback}}";

const REGENERATION_FEEDBACK: &str = "

A previous draft cited authorities that could not be verified:
{{failed_citations}}
Do not repeat these citations. Omit any citation you cannot ground in the \
partial results or reference passages.";

const GROUNDING: &str = "

Reference passages (cite only what these support):
{{passages}}";

/// Framing prompts wrapped around the caller's task prompt.
#[derive(Debug, Clone)]
pub struct PromptSet {
    /// System prompt for per-chunk calls. No placeholders.
    pub chunk_system: PromptTemplate,
    /// Placeholders: task, chunk_number, chunk_total, sources, excerpt, grounding.
    pub chunk_user: PromptTemplate,
    pub consolidation_system: PromptTemplate,
    /// Placeholders: task, partial_count, target_format, partials, grounding, feedback.
    pub consolidation_user: PromptTemplate,
    /// Placeholders: failed_citations.
    pub regeneration_feedback: PromptTemplate,
    /// Placeholders: passages.
    pub grounding: PromptTemplate,
}

impl PromptSet {
    pub fn builtin() -> Result<Self, PromptError> {
        Ok(Self {
            chunk_system: PromptTemplate::new(CHUNK_SYSTEM)?,
            chunk_user: PromptTemplate::new(CHUNK_USER)?,
            consolidation_system: PromptTemplate::new(CONSOLIDATION_SYSTEM)?,
            consolidation_user: PromptTemplate::new(CONSOLIDATION_USER)?,
            regeneration_feedback: PromptTemplate::new(REGENERATION_FEEDBACK)?,
            grounding: PromptTemplate::new(GROUNDING)?,
        })
    }

    /// Render the grounding block, or an empty string without passages.
    pub fn render_grounding(&self, passages: &[String]) -> Result<String, PromptError> {
        if passages.is_empty() {
            return Ok(String::new());
        }
        let listed = passages
            .iter()
            .enumerate()
            .map(|(i, p)| format!("[{}] {}", i + 1, p))
            .collect::<Vec<_>>()
            .join("\n\n");
        self.grounding.render(&[("passages", listed.as_str())])
    }

    /// Render the regeneration feedback block, or an empty string when
    /// nothing needs avoiding.
    pub fn render_feedback(&self, avoid: &[String]) -> Result<String, PromptError> {
        if avoid.is_empty() {
            return Ok(String::new());
        }
        let listed = avoid
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.regeneration_feedback
            .render(&[("failed_citations", listed.as_str())])
    }
}
