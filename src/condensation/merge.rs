//! Pure profile merge: prior profile plus newly accepted fragments in,
//! next profile plus a per-dimension change list out.

use std::collections::BTreeMap;

use crate::types::{Dimension, Fragment, Profile};

/// Weight of the prior score relative to the mean of the new evidence.
pub const PRIOR_WEIGHT: f64 = 3.0;

/// Summaries are trimmed from the front to this many characters.
pub const MAX_SUMMARY_CHARS: usize = 600;

/// New fragments whose leading sentence is appended per dimension.
pub const HIGHLIGHTS_PER_DIMENSION: usize = 3;

const MAX_SENTENCE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionChange {
    pub dimension: Dimension,
    pub score_before: f64,
    pub score_after: f64,
    pub fragments: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub profile: Profile,
    pub changes: Vec<DimensionChange>,
}

/// Fold `fragments` into `prior`. Dimensions without new evidence are
/// carried over untouched.
pub fn merge_profile(prior: &Profile, fragments: &[Fragment]) -> Merge {
    let mut by_dimension: BTreeMap<Dimension, Vec<&Fragment>> = BTreeMap::new();
    for fragment in fragments {
        by_dimension.entry(fragment.dimension).or_default().push(fragment);
    }

    let mut profile = prior.clone();
    let mut changes = Vec::with_capacity(by_dimension.len());

    for (dimension, mut evidence) in by_dimension {
        let before = prior.get(dimension);
        let mean = evidence.iter().map(|f| f.confidence).sum::<f64>() / evidence.len() as f64;
        let score = if before.is_empty() {
            mean
        } else {
            (before.score * PRIOR_WEIGHT + mean) / (PRIOR_WEIGHT + 1.0)
        }
        .clamp(0.0, 1.0);

        // Highest confidence first; ties keep submission order.
        evidence.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut summary = before.summary.clone();
        for fragment in evidence.iter().take(HIGHLIGHTS_PER_DIMENSION) {
            let sentence = leading_sentence(&fragment.content);
            if sentence.is_empty() {
                continue;
            }
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str(sentence);
        }

        let entry = profile.get_mut(dimension);
        entry.score = score;
        entry.summary = trim_front(&summary, MAX_SUMMARY_CHARS);

        changes.push(DimensionChange {
            dimension,
            score_before: before.score,
            score_after: score,
            fragments: evidence.len(),
        });
    }

    Merge { profile, changes }
}

/// One line per changed dimension, in canonical order.
pub fn summary_diff(changes: &[DimensionChange]) -> String {
    changes
        .iter()
        .map(|c| {
            format!(
                "{}: {:.2} -> {:.2} (+{} fragment{})",
                c.dimension,
                c.score_before,
                c.score_after,
                c.fragments,
                if c.fragments == 1 { "" } else { "s" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First sentence of `content`, capped at a fixed number of characters.
fn leading_sentence(content: &str) -> &str {
    let content = content.trim();
    let mut end = content.len();
    let mut chars = content.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            match chars.peek() {
                Some((_, next)) if next.is_whitespace() => {
                    end = i + c.len_utf8();
                    break;
                }
                None => break,
                _ => {}
            }
        }
    }
    let sentence = &content[..end];
    match sentence.char_indices().nth(MAX_SENTENCE_CHARS) {
        Some((cut, _)) => sentence[..cut].trim_end(),
        None => sentence,
    }
}

/// Keep the last `max` characters, starting at a word boundary when one is
/// available inside the kept tail.
fn trim_front(summary: &str, max: usize) -> String {
    let count = summary.chars().count();
    if count <= max {
        return summary.to_string();
    }
    let skip = count - max;
    let start = summary
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(summary.len());
    let tail = &summary[start..];
    match tail.find(' ') {
        Some(space) if space + 1 < tail.len() => tail[space + 1..].to_string(),
        _ => tail.to_string(),
    }
}
