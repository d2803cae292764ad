//! Listing identity, batch deduplication and dataset merge reconciliation for stagewatch.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "stagewatch-core";

/// Titles shorter than this (in characters, after trimming) are treated as extraction debris.
pub const DEFAULT_MIN_TITLE_CHARS: usize = 10;

/// Conventional domain labels offered at manual entry. Not enforced anywhere.
pub const KNOWN_DOMAINS: &[&str] = &[
    "Finance",
    "Analytics",
    "Investment Banking",
    "Risk Management",
    "Wealth Management",
    "Data Science",
];

/// Canonical listing record as persisted in the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub company: String,
    pub title: String,
    pub domain: String,
    pub location: String,
    pub duration: String,
    #[serde(rename = "startDate")]
    pub start_date: String,
    pub link: String,
}

impl Listing {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.company, &self.title)
    }
}

/// Listing-shaped value straight out of an extractor, a prompt or a persisted file.
/// Nothing about it is trusted until it passes [`RawCandidate::into_listing`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub company: Option<String>,
    pub title: Option<String>,
    pub domain: Option<String>,
    pub location: Option<String>,
    pub duration: Option<String>,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    pub link: Option<String>,
}

impl RawCandidate {
    pub fn identity(&self) -> Result<IdentityKey, MissingFieldError> {
        let company = required(self.company.as_deref(), RequiredField::Company)?;
        let title = required(self.title.as_deref(), RequiredField::Title)?;
        Ok(IdentityKey::new(company, title))
    }

    /// Validate the identity fields and fill every other absent field with an empty string.
    pub fn into_listing(self) -> Result<Listing, MissingFieldError> {
        self.identity()?;
        Ok(Listing {
            company: self.company.unwrap_or_default(),
            title: self.title.unwrap_or_default(),
            domain: self.domain.unwrap_or_default(),
            location: self.location.unwrap_or_default(),
            duration: self.duration.unwrap_or_default(),
            start_date: self.start_date.unwrap_or_default(),
            link: self.link.unwrap_or_default(),
        })
    }
}

impl From<Listing> for RawCandidate {
    fn from(listing: Listing) -> Self {
        Self {
            company: Some(listing.company),
            title: Some(listing.title),
            domain: Some(listing.domain),
            location: Some(listing.location),
            duration: Some(listing.duration),
            start_date: Some(listing.start_date),
            link: Some(listing.link),
        }
    }
}

fn required(value: Option<&str>, field: RequiredField) -> Result<&str, MissingFieldError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(MissingFieldError { field }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredField {
    Company,
    Title,
}

impl fmt::Display for RequiredField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Company => f.write_str("company"),
            Self::Title => f.write_str("title"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("listing is missing required field `{field}`")]
pub struct MissingFieldError {
    pub field: RequiredField,
}

/// Normalized `(company, title)` pair. The only equivalence between listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey {
    company: String,
    title: String,
}

impl IdentityKey {
    pub fn new(company: &str, title: &str) -> Self {
        Self {
            company: normalize_key_fragment(company),
            title: normalize_key_fragment(title),
        }
    }

    pub fn company(&self) -> &str {
        &self.company
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.company, self.title)
    }
}

pub fn normalize_key_fragment(input: &str) -> String {
    input.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    pub min_title_chars: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            min_title_chars: DEFAULT_MIN_TITLE_CHARS,
        }
    }
}

/// Per-batch counters; every candidate lands in exactly one of the last four buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub input: usize,
    pub missing_field: usize,
    pub implausible_title: usize,
    pub duplicates: usize,
    pub kept: usize,
}

impl DedupStats {
    pub fn rejected(&self) -> usize {
        self.missing_field + self.implausible_title
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOutcome {
    pub listings: Vec<Listing>,
    pub stats: DedupStats,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> DedupConfig {
        self.config
    }

    pub fn is_plausible_title(&self, title: &str) -> bool {
        title.trim().chars().count() >= self.config.min_title_chars
    }

    /// Collapse a batch to one listing per identity key.
    ///
    /// Candidates missing an identity field or carrying an implausibly short title are
    /// dropped before they can claim a key. Among true duplicates the first one seen
    /// survives, and output order is first-occurrence order.
    pub fn dedupe<I>(&self, batch: I) -> DedupOutcome
    where
        I: IntoIterator,
        I::Item: Into<RawCandidate>,
    {
        let mut seen = HashSet::new();
        let mut listings = Vec::new();
        let mut stats = DedupStats::default();

        for candidate in batch {
            stats.input += 1;
            let listing = match candidate.into().into_listing() {
                Ok(listing) => listing,
                Err(_) => {
                    stats.missing_field += 1;
                    continue;
                }
            };
            if !self.is_plausible_title(&listing.title) {
                stats.implausible_title += 1;
                continue;
            }
            if seen.insert(listing.identity()) {
                listings.push(listing);
            } else {
                stats.duplicates += 1;
            }
        }

        stats.kept = listings.len();
        DedupOutcome { listings, stats }
    }
}

/// [`Deduplicator::dedupe`] with the default plausibility threshold.
pub fn dedupe<I>(batch: I) -> DedupOutcome
where
    I: IntoIterator,
    I::Item: Into<RawCandidate>,
{
    Deduplicator::default().dedupe(batch)
}

/// Listings unique by identity key, in a deterministic order, plus the last-write stamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    last_updated: String,
    listings: Vec<Listing>,
    index: HashMap<IdentityKey, usize>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted listings. When a key appears more than once the first entry
    /// is kept and later ones are dropped.
    pub fn from_listings(
        last_updated: impl Into<String>,
        listings: impl IntoIterator<Item = Listing>,
    ) -> Self {
        Self::from_listings_counted(last_updated, listings).0
    }

    /// [`Dataset::from_listings`] plus the number of duplicate entries dropped.
    pub fn from_listings_counted(
        last_updated: impl Into<String>,
        listings: impl IntoIterator<Item = Listing>,
    ) -> (Self, usize) {
        let mut dataset = Self {
            last_updated: last_updated.into(),
            ..Self::default()
        };
        let mut collapsed = 0usize;
        for listing in listings {
            if dataset.contains_key(&listing.identity()) {
                collapsed += 1;
            } else {
                dataset.insert(listing);
            }
        }
        (dataset, collapsed)
    }

    pub fn last_updated(&self) -> &str {
        &self.last_updated
    }

    pub fn with_last_updated(mut self, last_updated: impl Into<String>) -> Self {
        self.last_updated = last_updated.into();
        self
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Listing> {
        self.index.get(key).map(|&pos| &self.listings[pos])
    }

    pub fn contains_key(&self, key: &IdentityKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Listing> {
        self.listings.iter()
    }

    pub fn listings(&self) -> &[Listing] {
        &self.listings
    }

    pub fn keys(&self) -> impl Iterator<Item = IdentityKey> + '_ {
        self.listings.iter().map(Listing::identity)
    }

    pub fn into_listings(self) -> Vec<Listing> {
        self.listings
    }

    /// Insert or replace by identity key. A replaced record keeps its position.
    pub fn insert(&mut self, listing: Listing) -> Option<Listing> {
        let key = listing.identity();
        match self.index.get(&key) {
            Some(&pos) => Some(std::mem::replace(&mut self.listings[pos], listing)),
            None => {
                self.index.insert(key, self.listings.len());
                self.listings.push(listing);
                None
            }
        }
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Listing;
    type IntoIter = std::slice::Iter<'a, Listing>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub preserved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub dataset: Dataset,
    pub summary: MergeSummary,
}

/// Right-biased union over identity keys: a key present in `new_batch` takes the new
/// record whole, a key present only in `old` keeps the old record untouched.
///
/// New records come first in batch order, followed by the surviving old records in
/// their previous order. The stamp is carried over from `old`.
pub fn reconcile<I>(new_batch: I, old: Dataset) -> MergeOutcome
where
    I: IntoIterator<Item = Listing>,
{
    let Dataset {
        last_updated,
        listings: old_listings,
        ..
    } = old;

    let mut merged = Dataset {
        last_updated,
        ..Dataset::default()
    };
    for listing in new_batch {
        merged.insert(listing);
    }

    let mut summary = MergeSummary::default();
    for listing in old_listings {
        if merged.contains_key(&listing.identity()) {
            summary.replaced += 1;
        } else {
            merged.insert(listing);
            summary.preserved += 1;
        }
    }
    summary.inserted = merged.len() - summary.replaced - summary.preserved;

    MergeOutcome {
        dataset: merged,
        summary,
    }
}

pub fn merge<I>(new_batch: I, old: Dataset) -> Dataset
where
    I: IntoIterator<Item = Listing>,
{
    reconcile(new_batch, old).dataset
}
