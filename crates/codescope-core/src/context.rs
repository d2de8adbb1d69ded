//! Chat context assembly under a character budget.
//!
//! Three sources feed a [`ContextBlock`]: recent conversation turns,
//! retrieved code chunks, and excerpts of the snapshot's latest analysis
//! report. The block is rendered in that order. When the rendering does
//! not fit the budget, items are dropped one at a time:
//!
//! 1. conversation turns, oldest first;
//! 2. then code chunks, lowest retrieval score first;
//! 3. then report excerpts, lowest relevance first.
//!
//! The rendered block never exceeds the budget; in the limit it is empty.

use std::collections::HashSet;

use crate::index::ScoredChunk;
use crate::report::ReportExcerpt;
use crate::session::ConversationTurn;

/// Approximate characters-per-token ratio used to convert token budgets.
pub const CHARS_PER_TOKEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "has", "have", "how",
    "what", "when", "where", "which", "who", "why", "does", "this", "that", "with", "from", "into",
    "there", "their", "about", "should", "would", "could", "is", "was", "use", "used",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub max_chars: usize,
}

impl ContextBudget {
    pub fn chars(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn tokens(max_tokens: usize) -> Self {
        Self {
            max_chars: max_tokens * CHARS_PER_TOKEN,
        }
    }
}

/// Per-item truncation applied before budgeting.
#[derive(Debug, Clone, Copy)]
pub struct ItemLimits {
    /// Maximum characters of a past question or answer.
    pub turn_chars: usize,
    /// Maximum characters of a code chunk.
    pub chunk_chars: usize,
}

impl Default for ItemLimits {
    fn default() -> Self {
        Self {
            turn_chars: 150,
            chunk_chars: 1500,
        }
    }
}

/// A report excerpt with its relevance to the current question.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredExcerpt {
    pub excerpt: ReportExcerpt,
    pub relevance: f32,
}

/// Assembled chat context.
#[derive(Debug, Clone, Default)]
pub struct ContextBlock {
    /// Chronological.
    pub turns: Vec<ConversationTurn>,
    /// Best score first.
    pub chunks: Vec<ScoredChunk>,
    /// Most relevant first.
    pub excerpts: Vec<ScoredExcerpt>,
    limits: Option<ItemLimits>,
}

impl ContextBlock {
    pub fn render(&self) -> String {
        let limits = self.limits.unwrap_or_default();
        let mut sections: Vec<String> = Vec::new();

        if !self.turns.is_empty() {
            let mut s = String::from("## Conversation so far\n");
            for turn in &self.turns {
                s.push_str(&format!(
                    "Q: {}\nA: {}\n",
                    truncate_chars(&turn.question, limits.turn_chars),
                    truncate_chars(&turn.answer, limits.turn_chars)
                ));
            }
            sections.push(s);
        }

        if !self.chunks.is_empty() {
            let mut s = String::from("## Relevant code\n");
            for (i, hit) in self.chunks.iter().enumerate() {
                s.push_str(&format!(
                    "[Source {}: {}]\n{}\n",
                    i + 1,
                    hit.chunk.location(),
                    truncate_chars(hit.chunk.text.trim_end(), limits.chunk_chars)
                ));
            }
            sections.push(s);
        }

        if !self.excerpts.is_empty() {
            let mut s = String::from("## Analysis findings\n");
            for scored in &self.excerpts {
                s.push_str(&format!(
                    "[{} / {}] {}\n",
                    scored.excerpt.role, scored.excerpt.key, scored.excerpt.text
                ));
            }
            sections.push(s);
        }

        sections.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.chunks.is_empty() && self.excerpts.is_empty()
    }

    pub fn used_chunk_ids(&self) -> Vec<String> {
        self.chunks.iter().map(|h| h.chunk.id.clone()).collect()
    }

    /// One-line description of what went into the block.
    pub fn summary(&self) -> String {
        let mut paths: Vec<&str> = Vec::new();
        for hit in &self.chunks {
            if !paths.contains(&hit.chunk.path.as_str()) {
                paths.push(&hit.chunk.path);
            }
        }
        let mut summary = format!(
            "{} turns, {} chunks, {} report excerpts",
            self.turns.len(),
            self.chunks.len(),
            self.excerpts.len()
        );
        if !paths.is_empty() {
            summary.push_str(&format!(" ({})", paths.join(", ")));
        }
        summary
    }
}

/// Build a [`ContextBlock`] that fits `budget`.
///
/// `turns` must be chronological; `chunks` and `excerpts` are re-sorted
/// by score so that truncation always removes the weakest item.
pub fn assemble_context(
    turns: &[ConversationTurn],
    mut chunks: Vec<ScoredChunk>,
    mut excerpts: Vec<ScoredExcerpt>,
    budget: ContextBudget,
    limits: ItemLimits,
) -> ContextBlock {
    chunks.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.chunk.ordinal.cmp(&b.chunk.ordinal))
    });
    excerpts.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

    let mut block = ContextBlock {
        turns: turns.to_vec(),
        chunks,
        excerpts,
        limits: Some(limits),
    };

    while block.render().chars().count() > budget.max_chars {
        if !block.turns.is_empty() {
            block.turns.remove(0);
        } else if !block.chunks.is_empty() {
            block.chunks.pop();
        } else if !block.excerpts.is_empty() {
            block.excerpts.pop();
        } else {
            break;
        }
    }
    block
}

/// Lower-cased content words of `text`, deduplicated, in order.
pub fn terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() >= 3 && !STOP_WORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Score report excerpts against a question and keep the relevant ones.
///
/// An excerpt is considered when at least one question term appears in
/// its key or text, or when it is a summary key (`*_summary`,
/// `overall_assessment`). Its score is the number of matching terms,
/// plus 2 when the question uses one of the excerpt role's keywords,
/// plus 1 for summary keys. The result is sorted by score; equal scores
/// keep report order.
pub fn rank_excerpts(question: &str, excerpts: Vec<ReportExcerpt>) -> Vec<ScoredExcerpt> {
    let question_terms = terms(question);
    let question_lower = question.to_lowercase();

    let mut scored: Vec<ScoredExcerpt> = excerpts
        .into_iter()
        .filter_map(|excerpt| {
            let haystack = format!("{} {}", excerpt.key.replace('_', " "), excerpt.text).to_lowercase();
            let matches = question_terms
                .iter()
                .filter(|t| haystack.contains(t.as_str()))
                .count();
            let is_summary = excerpt.key.ends_with("_summary") || excerpt.key == "overall_assessment";
            if matches == 0 && !is_summary {
                return None;
            }

            let mut score = matches as f32;
            if excerpt
                .role
                .keywords()
                .iter()
                .any(|kw| question_lower.contains(kw))
            {
                score += 2.0;
            }
            if is_summary {
                score += 1.0;
            }
            Some(ScoredExcerpt {
                excerpt,
                relevance: score,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    scored
}

/// Truncate to at most `max` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max <= 3 {
        return text.chars().take(max).collect();
    }
    let mut out: String = text.chars().take(max - 3).collect();
    out.push_str("...");
    out
}
