use super::step::StepSpec;
use crate::provenance::ArchiveId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Provenance boundary shared by every step in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PartitionKey {
    Archive(ArchiveId),
    Category(String),
    Duplicates,
}

impl PartitionKey {
    fn rank(&self) -> u8 {
        match self {
            PartitionKey::Archive(_) => 0,
            PartitionKey::Category(_) => 1,
            PartitionKey::Duplicates => 2,
        }
    }

    /// Short label used inside chunk ids.
    pub fn label(&self) -> String {
        match self {
            PartitionKey::Archive(id) => format!("archive-{}", id),
            PartitionKey::Category(name) => {
                let slug: String = name
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                    .collect();
                format!("category-{}", slug)
            }
            PartitionKey::Duplicates => "duplicates".to_string(),
        }
    }
}

impl Ord for PartitionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank()).then_with(|| match (self, other) {
            (PartitionKey::Archive(a), PartitionKey::Archive(b)) => a.cmp(b),
            (PartitionKey::Category(a), PartitionKey::Category(b)) => a.cmp(b),
            _ => Ordering::Equal,
        })
    }
}

impl PartialOrd for PartitionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Archive(id) => write!(f, "archive {}", id),
            PartitionKey::Category(name) => write!(f, "category {}", name),
            PartitionKey::Duplicates => f.write_str("duplicates"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub partition: PartitionKey,
    pub requires_approval: bool,
    pub steps: Vec<StepSpec>,
}

impl Chunk {
    /// BLAKE3 over the serialized steps. Any change to the chunk's content
    /// changes the digest, which invalidates earlier approvals.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.as_bytes());
        for step in &self.steps {
            // StepSpec only holds plain data; serializing it cannot fail
            let bytes = serde_json::to_vec(step).unwrap_or_default();
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        hasher.finalize().to_hex()[..32].to_string()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.steps.iter().map(|s| s.size).sum()
    }
}

/// Human confirmation for one gated chunk, bound to exactly that chunk's
/// contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub chunk_id: String,
    pub digest: String,
}

impl ApprovalToken {
    pub fn for_chunk(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            digest: chunk.digest(),
        }
    }

    /// Parse the `<chunk id>:<digest>` form printed by `plan`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (chunk_id, digest) = raw.trim().rsplit_once(':')?;
        if chunk_id.is_empty() || digest.is_empty() {
            return None;
        }
        Some(Self {
            chunk_id: chunk_id.to_string(),
            digest: digest.to_string(),
        })
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.chunk_id == chunk.id && self.digest == chunk.digest()
    }
}

impl fmt::Display for ApprovalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk_id, self.digest)
    }
}
