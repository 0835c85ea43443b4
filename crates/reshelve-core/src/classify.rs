use crate::config::CategoryRule;
use crate::scanner::FileRecord;
use crate::Error;
use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Category used by the age rule.
pub const AGED_CATEGORY: &str = "Archive";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalOrigin {
    Rule,
    Advisory,
}

/// What a classifier suggests for one file. Nothing here is trusted until
/// the planner has validated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub path: PathBuf,
    pub category: String,
    #[serde(default)]
    pub rename_to: Option<String>,
    pub confidence: f64,
    pub origin: ProposalOrigin,
}

pub trait Classifier {
    fn propose(&self, record: &FileRecord) -> Option<Proposal>;
}

/// Extension table plus an optional age rule. Always fully confident.
pub struct RuleClassifier {
    by_extension: AHashMap<String, String>,
    archive_after: Option<Duration>,
    now: DateTime<Utc>,
}

impl RuleClassifier {
    pub fn new(rules: &[CategoryRule], archive_after_days: Option<u64>, now: DateTime<Utc>) -> Self {
        let mut by_extension = AHashMap::new();
        for rule in rules {
            for ext in &rule.extensions {
                let ext = ext.trim_start_matches('.').to_ascii_lowercase();
                // First rule listing an extension owns it
                by_extension.entry(ext).or_insert_with(|| rule.name.clone());
            }
        }
        Self {
            by_extension,
            archive_after: archive_after_days.map(|days| Duration::days(days as i64)),
            now,
        }
    }
}

impl Classifier for RuleClassifier {
    fn propose(&self, record: &FileRecord) -> Option<Proposal> {
        let category = match self.archive_after {
            Some(age) if self.now - record.modified > age => Some(AGED_CATEGORY.to_string()),
            _ => record
                .path
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .and_then(|ext| self.by_extension.get(&ext).cloned()),
        }?;
        Some(Proposal {
            path: record.path.clone(),
            category,
            rename_to: None,
            confidence: 1.0,
            origin: ProposalOrigin::Rule,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Decision {
    path: PathBuf,
    category: String,
    #[serde(default)]
    rename_to: Option<String>,
    confidence: f64,
}

/// Decisions produced outside the engine (an advisory agent, a reviewer),
/// loaded from a JSON array of `{path, category, confidence, rename_to?}`.
#[derive(Debug, Default)]
pub struct DecisionSet {
    decisions: AHashMap<PathBuf, Proposal>,
}

impl DecisionSet {
    /// Relative paths in the file are resolved against `root`.
    pub fn from_json(json: &str, root: &Path) -> Result<Self, Error> {
        let raw: Vec<Decision> = serde_json::from_str(json)?;
        let mut decisions = AHashMap::with_capacity(raw.len());
        for decision in raw {
            let path = if decision.path.is_absolute() {
                decision.path
            } else {
                root.join(decision.path)
            };
            decisions.insert(
                path.clone(),
                Proposal {
                    path,
                    category: decision.category,
                    rename_to: decision.rename_to,
                    confidence: decision.confidence.clamp(0.0, 1.0),
                    origin: ProposalOrigin::Advisory,
                },
            );
        }
        debug!("Loaded {} advisory decisions", decisions.len());
        Ok(Self { decisions })
    }

    pub fn load(path: &Path, root: &Path) -> Result<Self, Error> {
        let json = fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
        let set = Self::from_json(&json, root)?;
        info!("Loaded advisory decisions from {}", path.display());
        Ok(set)
    }
}

impl Classifier for DecisionSet {
    fn propose(&self, record: &FileRecord) -> Option<Proposal> {
        self.decisions.get(&record.path).cloned()
    }
}

/// Asks each classifier in turn; the first proposal wins.
#[derive(Default)]
pub struct ChainClassifier {
    chain: Vec<Box<dyn Classifier + Send + Sync>>,
}

impl ChainClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, classifier: impl Classifier + Send + Sync + 'static) -> Self {
        self.chain.push(Box::new(classifier));
        self
    }
}

impl Classifier for ChainClassifier {
    fn propose(&self, record: &FileRecord) -> Option<Proposal> {
        self.chain.iter().find_map(|c| c.propose(record))
    }
}

/// Accepts `name` only if it is exactly one normal path component.
pub fn safe_component(name: &str) -> Option<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\\') {
        return None;
    }
    let mut components = Path::new(trimmed).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(trimmed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_categories;
    use crate::hasher::ContentHash;

    fn record(path: &str, age_days: i64, now: DateTime<Utc>) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            hash: ContentHash::from_hex("00"),
            size: 1,
            modified: now - Duration::days(age_days),
            signature: 0,
        }
    }

    #[test]
    fn test_rule_classifier_uses_extension_table() {
        let now = Utc::now();
        let rules = RuleClassifier::new(&default_categories(), None, now);
        let p = rules.propose(&record("/d/Report.PDF", 0, now)).unwrap();
        assert_eq!(p.category, "Documents");
        assert_eq!(p.origin, ProposalOrigin::Rule);
        assert_eq!(p.confidence, 1.0);
        assert_eq!(
            rules.propose(&record("/d/setup.exe", 0, now)).unwrap().category,
            "Executables"
        );
        assert!(rules.propose(&record("/d/mystery.qqq", 0, now)).is_none());
    }

    #[test]
    fn test_age_rule_overrides_extension() {
        let now = Utc::now();
        let rules = RuleClassifier::new(&default_categories(), Some(30), now);
        assert_eq!(
            rules.propose(&record("/d/old.pdf", 45, now)).unwrap().category,
            AGED_CATEGORY
        );
        assert_eq!(
            rules.propose(&record("/d/new.pdf", 3, now)).unwrap().category,
            "Documents"
        );
    }

    #[test]
    fn test_chain_prefers_advisory_decision() {
        let now = Utc::now();
        let json = r#"[{"path": "scan.pdf", "category": "Receipts", "confidence": 0.4}]"#;
        let advisory = DecisionSet::from_json(json, Path::new("/d")).unwrap();
        let chain = ChainClassifier::new()
            .with(advisory)
            .with(RuleClassifier::new(&default_categories(), None, now));

        let p = chain.propose(&record("/d/scan.pdf", 0, now)).unwrap();
        assert_eq!(p.category, "Receipts");
        assert_eq!(p.origin, ProposalOrigin::Advisory);
        assert_eq!(
            chain.propose(&record("/d/other.pdf", 0, now)).unwrap().origin,
            ProposalOrigin::Rule
        );
    }

    #[test]
    fn test_safe_component() {
        assert_eq!(safe_component("Receipts"), Some("Receipts"));
        assert_eq!(safe_component(".."), None);
        assert_eq!(safe_component("a/b"), None);
        assert_eq!(safe_component("/etc"), None);
        assert_eq!(safe_component("  "), None);
    }
}
