//! Membership index: which category every advertisable identifier belongs to.
//!
//! Built once before the node starts and shared read-only afterwards.

use crate::error::VerifyError;
use crate::identifier::{Identifier, KadId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::warn;

/// Category of an advertised identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Content explicitly under test.
    Root,
    /// Incidental local blocks (directories, intermediate nodes).
    Other,
    /// The well-known placeholder item.
    Sentinel,
    /// Anything the index does not know about.
    Unknown,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Other => write!(f, "other"),
            Self::Sentinel => write!(f, "sentinel"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A root item: its diagnostic label and precomputed keyspace position.
#[derive(Debug, Clone)]
pub struct RootEntry {
    /// Human-readable label, usually the originating CID.
    pub label: String,
    /// Kademlia identifier of the multihash.
    pub kad_id: KadId,
}

/// One line of a CID list file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidEntry {
    /// The content identifier string.
    pub cid: String,
    /// Optional label following the CID.
    pub label: Option<String>,
}

/// Parse the `CID [label...]` list format. Blank lines and `#` comments are ignored.
pub fn parse_cid_list(text: &str) -> Vec<CidEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let cid = parts.next()?.to_string();
            let label = parts
                .next()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string);
            Some(CidEntry { cid, label })
        })
        .collect()
}

/// Keep the first entry for each `bits`-wide Kademlia prefix.
///
/// Yields a root set that covers the keyspace evenly. Malformed CIDs are
/// skipped with a warning. The map iterates in prefix order.
pub fn one_per_prefix(entries: &[CidEntry], bits: u8) -> BTreeMap<u32, (CidEntry, KadId)> {
    let mut selected = BTreeMap::new();
    for entry in entries {
        match Identifier::from_content_id(&entry.cid) {
            Ok(id) => {
                let kad_id = id.kad_id();
                selected
                    .entry(kad_id.prefix(bits))
                    .or_insert_with(|| (entry.clone(), kad_id));
            }
            Err(e) => warn!("Skipping {}", e),
        }
    }
    selected
}

/// Immutable identifier → category mapping.
#[derive(Debug, Clone, Default)]
pub struct MembershipIndex {
    roots: HashMap<Identifier, RootEntry>,
    others: HashSet<Identifier>,
    sentinel: Option<Identifier>,
}

impl MembershipIndex {
    /// Build the index.
    ///
    /// `other` is every locally known identifier that is neither a root nor
    /// the sentinel. A root that equals the sentinel stays a root.
    pub fn build(
        roots: impl IntoIterator<Item = (Identifier, String)>,
        all_local: impl IntoIterator<Item = Identifier>,
        sentinel: Option<Identifier>,
    ) -> Self {
        let roots: HashMap<Identifier, RootEntry> = roots
            .into_iter()
            .map(|(id, label)| {
                let kad_id = id.kad_id();
                (id, RootEntry { label, kad_id })
            })
            .collect();

        let others = all_local
            .into_iter()
            .filter(|id| !roots.contains_key(id) && sentinel.as_ref() != Some(id))
            .collect();

        let sentinel = sentinel.filter(|s| !roots.contains_key(s));

        Self {
            roots,
            others,
            sentinel,
        }
    }

    /// Build the index from CID strings.
    ///
    /// Malformed identifiers are skipped with a warning and returned alongside
    /// the index; a single corrupt input never aborts the build.
    pub fn from_content_ids(
        roots: &[CidEntry],
        all_local: &[String],
        sentinel: Option<&str>,
    ) -> (Self, Vec<VerifyError>) {
        let mut skipped = Vec::new();

        let mut root_ids = Vec::with_capacity(roots.len());
        for entry in roots {
            match Identifier::from_content_id(&entry.cid) {
                Ok(id) => {
                    let label = entry.label.clone().unwrap_or_else(|| entry.cid.clone());
                    root_ids.push((id, label));
                }
                Err(e) => {
                    warn!("Skipping root item: {}", e);
                    skipped.push(e);
                }
            }
        }

        let mut local_ids = Vec::with_capacity(all_local.len());
        for cid in all_local {
            match Identifier::from_content_id(cid) {
                Ok(id) => local_ids.push(id),
                Err(e) => {
                    warn!("Skipping local item: {}", e);
                    skipped.push(e);
                }
            }
        }

        let sentinel_id = match sentinel.map(Identifier::from_content_id) {
            Some(Ok(id)) => Some(id),
            Some(Err(e)) => {
                warn!("Skipping sentinel item: {}", e);
                skipped.push(e);
                None
            }
            None => None,
        };

        (Self::build(root_ids, local_ids, sentinel_id), skipped)
    }

    /// Category of `id`.
    pub fn classify(&self, id: &Identifier) -> Category {
        if self.roots.contains_key(id) {
            Category::Root
        } else if self.others.contains(id) {
            Category::Other
        } else if self.sentinel.as_ref() == Some(id) {
            Category::Sentinel
        } else {
            Category::Unknown
        }
    }

    /// Root entry for `id`.
    pub fn root(&self, id: &Identifier) -> Option<&RootEntry> {
        self.roots.get(id)
    }

    /// Every root identifier.
    pub fn root_universe(&self) -> impl Iterator<Item = &Identifier> {
        self.roots.keys()
    }

    /// Every identifier with a known category: roots, others and the sentinel.
    pub fn tracked_identifiers(&self) -> impl Iterator<Item = &Identifier> {
        self.roots
            .keys()
            .chain(self.others.iter())
            .chain(self.sentinel.iter())
    }

    /// Number of root items.
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Number of other items.
    pub fn other_count(&self) -> usize {
        self.others.len()
    }

    /// Whether a sentinel is tracked.
    pub fn has_sentinel(&self) -> bool {
        self.sentinel.is_some()
    }
}
