//! Story intelligence scoring.
//!
//! Every story carries classifier signals (author, tag, title, feed). They fold
//! into one of three buckets which drive the split unread counts. Scoring is a
//! pure function of a versioned input so the rules can change without
//! rewriting stored stories.

use serde::{Deserialize, Serialize};

/// Version of the scoring rules applied to newly stored stories.
pub const SCORING_VERSION: u32 = 1;

/// Classifier signals for one story.
///
/// Each signal is a small signed score: positive means the user trained the
/// classifier to like it, negative to dislike it, zero means no opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoryIntelligence {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub author: i32,
    #[serde(default)]
    pub tag: i32,
    #[serde(default)]
    pub title: i32,
    #[serde(default)]
    pub feed: i32,
}

fn default_version() -> u32 {
    SCORING_VERSION
}

impl Default for StoryIntelligence {
    fn default() -> Self {
        Self {
            version: SCORING_VERSION,
            author: 0,
            tag: 0,
            title: 0,
            feed: 0,
        }
    }
}

/// Intelligence bucket a story counts towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Negative,
    Neutral,
    Positive,
}

impl Bucket {
    fn from_score(score: i32) -> Self {
        match score {
            s if s > 0 => Bucket::Positive,
            0 => Bucket::Neutral,
            _ => Bucket::Negative,
        }
    }
}

/// Which buckets the reader is currently showing.
///
/// `Best` only counts positive stories, `Some` adds neutral ones and `All`
/// counts everything, including stories the user trained away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntelligenceFilter {
    #[default]
    All,
    Some,
    Best,
}

impl IntelligenceFilter {
    /// Whether stories in `bucket` are visible under this filter.
    pub fn includes(self, bucket: Bucket) -> bool {
        match self {
            IntelligenceFilter::All => true,
            IntelligenceFilter::Some => bucket != Bucket::Negative,
            IntelligenceFilter::Best => bucket == Bucket::Positive,
        }
    }
}

/// Compute the folded score for a story.
///
/// Unknown (future) versions fall back to the newest rules this build knows.
pub fn score(input: &StoryIntelligence) -> i32 {
    match input.version {
        1 => score_v1(input),
        other => {
            tracing::debug!(version = other, "Unknown scoring version, using current rules");
            score_v1(input)
        }
    }
}

/// Bucket for a story's signals.
pub fn bucket(input: &StoryIntelligence) -> Bucket {
    Bucket::from_score(score(input))
}

/// v1: the strongest explicit opinion on author/tag/title wins, positive
/// first; the feed-level score only applies when those are all neutral.
fn score_v1(input: &StoryIntelligence) -> i32 {
    let signals = [input.author, input.tag, input.title];
    let max = signals.iter().copied().max().unwrap_or(0);
    let min = signals.iter().copied().min().unwrap_or(0);

    if max > 0 {
        max
    } else if min < 0 {
        min
    } else {
        input.feed
    }
}
