//! Relative load priority of pending resources.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::Mutex;

use crate::types::{ResourceType, normalize_url};

/// File stems of bundles that everything else depends on.
const CRITICAL_BUNDLES: &[&str] = &["main", "app", "runtime", "vendor", "polyfills", "index"];

const CRITICAL_BUNDLE_WEIGHT: f64 = 3.0;
const FAILURE_DECAY: f64 = 0.85;
const MIN_LEARNED_FACTOR: f64 = 0.5;
const SUCCESS_BONUS: f64 = 0.02;
const MAX_LEARNED_FACTOR: f64 = 1.2;
const VISIBLE_BOOST: f64 = 1.5;
const NAVIGATION_BOOST: f64 = 1.2;

/// Scores pending resources, the loader sorts by `priority * factor`.
pub trait PriorityScorer: Send + Sync + fmt::Debug {
    /// The multiplicative factor for a (normalized) url.
    fn factor(&self, url: &str) -> f64;

    /// Learns from the final outcome of a load.
    fn record_outcome(&self, _url: &str, _success: bool) {}

    /// Marks urls as visible to the user right now, replacing the previous set.
    fn mark_visible(&self, _urls: &[String]) {}

    /// Marks urls as likely needed for the next navigation, replacing the previous set.
    fn set_navigation_hints(&self, _urls: &[String]) {}
}

/// Sorts urls by descending score. Ties keep their order.
pub fn sort_by_score(scorer: &dyn PriorityScorer, urls: &mut [String], priority: u32) {
    let base = priority.max(1) as f64;
    let mut scored: Vec<(f64, String)> = urls
        .iter()
        .map(|url| (base * scorer.factor(url), url.clone()))
        .collect();
    // `sort_by` is stable
    scored.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    for (slot, (_, url)) in urls.iter_mut().zip(scored) {
        *slot = url;
    }
}

/// Scores by file type, learned outcomes and viewport hints.
#[derive(Debug, Default)]
pub struct HeuristicScorer {
    learned: Mutex<HashMap<String, f64>>,
    visible: Mutex<HashSet<String>>,
    navigation: Mutex<HashSet<String>>,
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The static weight derived from the url alone.
    pub fn static_weight(url: &str) -> f64 {
        if is_critical_bundle(url) {
            return CRITICAL_BUNDLE_WEIGHT;
        }
        match ResourceType::from_url(url) {
            ResourceType::Stylesheet => 2.5,
            ResourceType::Script => 2.0,
            ResourceType::Data => 1.5,
            ResourceType::Font => 1.2,
            ResourceType::Image => 0.8,
            ResourceType::Other => 1.0,
        }
    }

    fn learned_factor(&self, url: &str) -> f64 {
        self.learned.lock().get(url).copied().unwrap_or(1.0)
    }
}

fn is_critical_bundle(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.split(['.', '-', '_', '~']).next().unwrap_or(file);
    ResourceType::from_url(url) == ResourceType::Script
        && CRITICAL_BUNDLES
            .iter()
            .any(|name| stem.eq_ignore_ascii_case(name))
}

impl PriorityScorer for HeuristicScorer {
    fn factor(&self, url: &str) -> f64 {
        let mut factor = Self::static_weight(url) * self.learned_factor(url);
        if self.visible.lock().contains(url) {
            factor *= VISIBLE_BOOST;
        }
        if self.navigation.lock().contains(url) {
            factor *= NAVIGATION_BOOST;
        }
        factor
    }

    fn record_outcome(&self, url: &str, success: bool) {
        let mut learned = self.learned.lock();
        let factor = learned.entry(url.to_owned()).or_insert(1.0);
        *factor = if success {
            (*factor + SUCCESS_BONUS).min(MAX_LEARNED_FACTOR)
        } else {
            (*factor * FAILURE_DECAY).max(MIN_LEARNED_FACTOR)
        };
    }

    fn mark_visible(&self, urls: &[String]) {
        *self.visible.lock() = urls.iter().map(|url| normalize_url(url)).collect();
    }

    fn set_navigation_hints(&self, urls: &[String]) {
        *self.navigation.lock() = urls.iter().map(|url| normalize_url(url)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_static_weights() {
        assert_eq!(HeuristicScorer::static_weight("/js/main.4f2a.js"), 3.0);
        assert_eq!(HeuristicScorer::static_weight("/js/vendor-react.js"), 3.0);
        assert_eq!(HeuristicScorer::static_weight("/js/widget.js"), 2.0);
        assert_eq!(HeuristicScorer::static_weight("/css/site.css"), 2.5);
        assert_eq!(HeuristicScorer::static_weight("/img/main.png"), 0.8);
        assert_eq!(HeuristicScorer::static_weight("/api/index"), 1.0);
    }

    #[test]
    fn test_sort_is_stable() {
        let scorer = HeuristicScorer::new();
        let mut list = urls(&["/a.png", "/b.css", "/c.png", "/d.js", "/e.png"]);
        sort_by_score(&scorer, &mut list, 5);
        assert_eq!(list, urls(&["/b.css", "/d.js", "/a.png", "/c.png", "/e.png"]));
    }

    #[test]
    fn test_learned_factor_bounds() {
        let scorer = HeuristicScorer::new();
        for _ in 0..20 {
            scorer.record_outcome("/flaky.js", false);
        }
        assert_eq!(scorer.factor("/flaky.js"), 2.0 * MIN_LEARNED_FACTOR);

        for _ in 0..100 {
            scorer.record_outcome("/solid.js", true);
        }
        assert!((scorer.factor("/solid.js") - 2.0 * MAX_LEARNED_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn test_visibility_boost() {
        let scorer = HeuristicScorer::new();
        let mut list = urls(&["/hero.png", "/below-fold.png"]);

        scorer.mark_visible(&urls(&["/below-fold.png"]));
        sort_by_score(&scorer, &mut list, 5);
        assert_eq!(list[0], "/below-fold.png");

        scorer.mark_visible(&[]);
        scorer.set_navigation_hints(&urls(&["/hero.png"]));
        sort_by_score(&scorer, &mut list, 5);
        assert_eq!(list[0], "/hero.png");
    }
}
