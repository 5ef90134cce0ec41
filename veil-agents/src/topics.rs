//! Topic detection
//!
//! Assigns a coarse category to a text. The label only feeds the
//! calibrator's state key, so a cheap keyword vote is enough.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use veil_core::TopicLabel;

use crate::text::tokenize;

/// Pure text -> topic mapping
pub trait TopicDetector: Send + Sync {
    fn detect(&self, text: &str) -> TopicLabel;
}

/// Thread-safe reference to a topic detector
pub type SharedTopicDetector = Arc<dyn TopicDetector>;

/// A topic and the keywords that vote for it
#[derive(Debug, Clone, Deserialize)]
pub struct TopicDefinition {
    pub name: String,
    pub keywords: Vec<String>,
}

impl TopicDefinition {
    fn new(name: &str, keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Built-in topics
pub fn default_topics() -> Vec<TopicDefinition> {
    vec![
        TopicDefinition::new(
            "drugs",
            &["cocaine", "heroin", "fentanyl", "mdma", "meth", "cannabis", "pills", "opioids", "lsd"],
        ),
        TopicDefinition::new(
            "weapons",
            &["firearm", "firearms", "gun", "guns", "pistol", "rifle", "ammunition", "ammo", "explosives"],
        ),
        TopicDefinition::new(
            "fraud",
            &["cvv", "fullz", "carding", "dumps", "counterfeit", "passport", "paypal", "bank", "cashout"],
        ),
        TopicDefinition::new(
            "malware",
            &["ransomware", "botnet", "stealer", "keylogger", "rat", "exploit", "zero-day", "0day", "crypter", "loader"],
        ),
        TopicDefinition::new(
            "data_leak",
            &["leak", "leaked", "breach", "database", "combolist", "credentials", "dox", "records"],
        ),
        TopicDefinition::new(
            "services",
            &["hacking", "ddos", "hitman", "laundering", "mixer", "escrow", "hire"],
        ),
    ]
}

/// Picks the topic with the most keyword hits.
///
/// Ties go to the topic declared first; no hits gives `general`.
pub struct KeywordTopicDetector {
    topics: Vec<(TopicLabel, HashSet<String>)>,
}

impl KeywordTopicDetector {
    pub fn new(definitions: Vec<TopicDefinition>) -> Self {
        let topics = definitions
            .into_iter()
            .map(|def| {
                let keywords = def.keywords.iter().map(|k| k.to_lowercase()).collect();
                (TopicLabel::new(def.name), keywords)
            })
            .collect();

        Self { topics }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_topics())
    }
}

impl TopicDetector for KeywordTopicDetector {
    fn detect(&self, text: &str) -> TopicLabel {
        let words = tokenize(text);
        let mut best: Option<(&TopicLabel, usize)> = None;

        for (label, keywords) in &self.topics {
            let hits = words.iter().filter(|w| keywords.contains(*w)).count();
            if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
                best = Some((label, hits));
            }
        }

        best.map(|(label, _)| label.clone())
            .unwrap_or_else(TopicLabel::general)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_majority_topic() {
        let detector = KeywordTopicDetector::with_defaults();
        assert_eq!(
            detector.detect("Fresh CVV, fullz and bank logins. Also one rifle.").as_str(),
            "fraud"
        );
        assert_eq!(detector.detect("New ransomware loader with crypter").as_str(), "malware");
    }

    #[test]
    fn test_tie_goes_to_first_declared() {
        let detector = KeywordTopicDetector::with_defaults();
        assert_eq!(detector.detect("cocaine and a pistol").as_str(), "drugs");
    }

    #[test]
    fn test_no_hits_is_general() {
        let detector = KeywordTopicDetector::with_defaults();
        assert_eq!(detector.detect("Welcome to our forum"), TopicLabel::general());
    }

    #[test]
    fn test_custom_topics() {
        let detector = KeywordTopicDetector::new(vec![TopicDefinition {
            name: "crypto".to_string(),
            keywords: vec!["Monero".to_string()],
        }]);
        assert_eq!(detector.detect("monero only").as_str(), "crypto");
    }
}
