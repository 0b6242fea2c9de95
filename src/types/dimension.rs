//! The closed set of profile dimensions and the fixed-shape profile record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the six facets a soul profile is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Personality,
    Knowledge,
    Stance,
    Style,
    Relationship,
    Timeline,
}

impl Dimension {
    /// All dimensions in canonical order.
    pub const ALL: [Dimension; 6] = [
        Dimension::Personality,
        Dimension::Knowledge,
        Dimension::Stance,
        Dimension::Style,
        Dimension::Relationship,
        Dimension::Timeline,
    ];

    /// Wire name of the dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Personality => "personality",
            Dimension::Knowledge => "knowledge",
            Dimension::Stance => "stance",
            Dimension::Style => "style",
            Dimension::Relationship => "relationship",
            Dimension::Timeline => "timeline",
        }
    }

    /// Human-readable heading used in rendered prompts.
    pub fn label(&self) -> &'static str {
        match self {
            Dimension::Personality => "Personality",
            Dimension::Knowledge => "Knowledge & expertise",
            Dimension::Stance => "Positions & stances",
            Dimension::Style => "Voice & style",
            Dimension::Relationship => "Relationships",
            Dimension::Timeline => "Timeline",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known dimension.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dimension '{0}'")]
pub struct UnknownDimension(pub String);

impl FromStr for Dimension {
    type Err = UnknownDimension;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dimension::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| UnknownDimension(s.to_string()))
    }
}

/// Score and condensed summary for one dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionEntry {
    /// Confidence in this facet of the profile, in `[0, 1]`.
    pub score: f64,
    /// Condensed prose summary.
    pub summary: String,
}

impl DimensionEntry {
    /// An entry that has never absorbed any evidence.
    pub fn is_empty(&self) -> bool {
        self.score == 0.0 && self.summary.is_empty()
    }
}

/// Per-dimension profile, one entry for every [`Dimension`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub personality: DimensionEntry,
    #[serde(default)]
    pub knowledge: DimensionEntry,
    #[serde(default)]
    pub stance: DimensionEntry,
    #[serde(default)]
    pub style: DimensionEntry,
    #[serde(default)]
    pub relationship: DimensionEntry,
    #[serde(default)]
    pub timeline: DimensionEntry,
}

impl Profile {
    pub fn get(&self, dimension: Dimension) -> &DimensionEntry {
        match dimension {
            Dimension::Personality => &self.personality,
            Dimension::Knowledge => &self.knowledge,
            Dimension::Stance => &self.stance,
            Dimension::Style => &self.style,
            Dimension::Relationship => &self.relationship,
            Dimension::Timeline => &self.timeline,
        }
    }

    pub fn get_mut(&mut self, dimension: Dimension) -> &mut DimensionEntry {
        match dimension {
            Dimension::Personality => &mut self.personality,
            Dimension::Knowledge => &mut self.knowledge,
            Dimension::Stance => &mut self.stance,
            Dimension::Style => &mut self.style,
            Dimension::Relationship => &mut self.relationship,
            Dimension::Timeline => &mut self.timeline,
        }
    }

    /// Iterate entries in canonical dimension order.
    pub fn iter(&self) -> impl Iterator<Item = (Dimension, &DimensionEntry)> {
        Dimension::ALL.into_iter().map(move |d| (d, self.get(d)))
    }
}
