//! Page complexity analysis and timeout strategy selection.
//!
//! The complexity module turns raw scout measurements into a weighted
//! score in [0, 1] and maps the score to a timeout strategy. The weights
//! favour DOM size and script volume, the dominant cost drivers for
//! downstream analyzers.

use serde::{Deserialize, Serialize};

/// Raw complexity signals measured by the scout for one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexitySignals {
    /// Total DOM node count
    pub dom_nodes: u32,
    /// Number of script elements
    pub script_count: u32,
    /// Lazy-load indicators detected (infinite scroll, IntersectionObserver use)
    pub lazy_load_indicators: u32,
    /// Number of iframes
    pub iframe_count: u32,
    /// Initial page load time in milliseconds
    pub load_time_ms: u64,
}

impl ComplexitySignals {
    // Saturation points for normalizing each raw signal into [0, 1].
    const DOM_SATURATION: f64 = 5_000.0;
    const SCRIPT_SATURATION: f64 = 50.0;
    const LAZY_SATURATION: f64 = 5.0;
    const IFRAME_SATURATION: f64 = 10.0;
    const LOAD_SATURATION_MS: f64 = 10_000.0;

    /// Weighted complexity score in [0, 1].
    ///
    /// Weights: DOM nodes 35%, scripts 25%, lazy-load 20%, iframes 10%,
    /// load time 10%.
    pub fn score(&self) -> f64 {
        let dom = (self.dom_nodes as f64 / Self::DOM_SATURATION).min(1.0);
        let scripts = (self.script_count as f64 / Self::SCRIPT_SATURATION).min(1.0);
        let lazy = (self.lazy_load_indicators as f64 / Self::LAZY_SATURATION).min(1.0);
        let iframes = (self.iframe_count as f64 / Self::IFRAME_SATURATION).min(1.0);
        let load = (self.load_time_ms as f64 / Self::LOAD_SATURATION_MS).min(1.0);

        0.35 * dom + 0.25 * scripts + 0.20 * lazy + 0.10 * iframes + 0.10 * load
    }

    /// Select the timeout strategy for this page.
    pub fn strategy(&self) -> TimeoutStrategy {
        TimeoutStrategy::from_score(self.score())
    }
}

/// Timeout strategy selected from the complexity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutStrategy {
    /// Simple pages: score < 0.30
    Fast,
    /// Typical pages: 0.30 <= score <= 0.60
    Standard,
    /// Heavy pages: score > 0.60
    Conservative,
}

impl TimeoutStrategy {
    /// Map a complexity score to a strategy.
    pub fn from_score(score: f64) -> Self {
        if score < 0.30 {
            Self::Fast
        } else if score <= 0.60 {
            Self::Standard
        } else {
            Self::Conservative
        }
    }

    /// Multiplier applied to an analyzer's base timeout.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Fast => 0.5,
            Self::Standard => 1.0,
            Self::Conservative => 2.0,
        }
    }
}

impl std::fmt::Display for TimeoutStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Standard => write!(f, "standard"),
            Self::Conservative => write!(f, "conservative"),
        }
    }
}
