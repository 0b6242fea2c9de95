//! System prompt rendering.

use serde::Serialize;
use tera::{Context, Tera};

use crate::types::{Profile, Soul};

const SYSTEM_PROMPT_TEMPLATE: &str = r#"You are {{ display_name }} (@{{ handle }}), speaking in your own voice.
This is version {{ version }} of your profile, assembled from curated community contributions.
{% if has_dimensions %}{% for d in dimensions %}
## {{ d.label }} (confidence {{ d.score }})
{{ d.summary }}
{% endfor %}{% else %}
Little is known about you yet. Keep answers modest and do not invent specifics.
{% endif %}
Stay in character. When a question falls outside what is known about you, say so instead of guessing."#;

#[derive(Debug, Serialize)]
struct DimensionView {
    label: &'static str,
    score: String,
    summary: String,
}

/// Render the system prompt for `soul` at `version` from `profile`.
///
/// Dimensions with no summary yet are omitted.
pub fn render_system_prompt(
    soul: &Soul,
    profile: &Profile,
    version: i64,
) -> Result<String, tera::Error> {
    let dimensions: Vec<DimensionView> = profile
        .iter()
        .filter(|(_, entry)| !entry.summary.is_empty())
        .map(|(dimension, entry)| DimensionView {
            label: dimension.label(),
            score: format!("{:.2}", entry.score),
            summary: entry.summary.clone(),
        })
        .collect();

    let mut context = Context::new();
    context.insert("display_name", &soul.display_name);
    context.insert("handle", &soul.handle);
    context.insert("version", &version);
    context.insert("has_dimensions", &!dimensions.is_empty());
    context.insert("dimensions", &dimensions);

    Tera::one_off(SYSTEM_PROMPT_TEMPLATE, &context, false)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::Dimension;

    #[test]
    fn test_base_prompt_for_new_soul() {
        let soul = Soul::new("vitalik", "Vitalik", "0x01", Utc::now());
        let prompt = render_system_prompt(&soul, &soul.profile, 0).unwrap();
        assert!(prompt.starts_with("You are Vitalik (@vitalik)"));
        assert!(prompt.contains("Little is known about you yet"));
        assert!(!prompt.contains("##"));
    }

    #[test]
    fn test_prompt_lists_known_dimensions() {
        let soul = Soul::new("ada", "Ada Lovelace", "0x01", Utc::now());
        let mut profile = Profile::default();
        profile.get_mut(Dimension::Knowledge).score = 0.82;
        profile.get_mut(Dimension::Knowledge).summary = "Wrote the first published algorithm.".into();

        let prompt = render_system_prompt(&soul, &profile, 4).unwrap();
        assert!(prompt.contains("version 4"));
        assert!(prompt.contains("## Knowledge & expertise (confidence 0.82)"));
        assert!(prompt.contains("Wrote the first published algorithm."));
        assert!(!prompt.contains("Timeline"));
    }
}
