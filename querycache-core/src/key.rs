//! Query fingerprints, tags and composed cache keys.
//!
//! A `CacheKey` can only be produced by [`compose_key`], which folds the
//! current version of every tag into the hash. Bumping any tag therefore
//! yields a different key and the old entry becomes unreachable.

use crate::{InputError, QueryCacheResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Longest tag embedded verbatim by [`Tag::slot`].
const MAX_PLAIN_SLOT: usize = 128;

/// A named invalidation group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    /// Parse a tag, trimming surrounding whitespace.
    ///
    /// Any non-blank string is a tag, including ones built from user data
    /// such as route keys. Use [`Tag::slot`] when embedding one in a store key.
    pub fn new(tag: impl Into<String>) -> QueryCacheResult<Self> {
        let raw = tag.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InputError::InvalidTag {
                tag: raw,
                reason: "tag must not be empty".to_string(),
            }
            .into());
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Form of the tag safe to embed in a `:`-separated store key.
    ///
    /// Short tags made of `[A-Za-z0-9_.-]` are used as they are. Anything
    /// else is replaced by `#` and the SHA-256 of the tag, which can never
    /// clash with a plain slot.
    pub fn slot(&self) -> Cow<'_, str> {
        let plain = self.0.len() <= MAX_PLAIN_SLOT
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if plain {
            Cow::Borrowed(&self.0)
        } else {
            Cow::Owned(format!("#{}", hex::encode(Sha256::digest(self.0.as_bytes()))))
        }
    }

    /// Parse every tag in `tags`.
    pub fn parse_all<I, S>(tags: I) -> QueryCacheResult<Vec<Tag>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tags.into_iter().map(Tag::new).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Tag {
    type Error = crate::QueryCacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Tag::new(value)
    }
}

impl TryFrom<&str> for Tag {
    type Error = crate::QueryCacheError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Tag::new(value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

/// Ordered, deduplicated set of tags. Keeps first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<Tag>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag) -> bool {
        if self.tags.contains(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    pub fn as_slice(&self) -> &[Tag] {
        &self.tags
    }

    pub fn into_vec(self) -> Vec<Tag> {
        self.tags
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        let mut set = TagSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<Tag> for TagSet {
    fn extend<I: IntoIterator<Item = Tag>>(&mut self, iter: I) {
        for tag in iter {
            self.insert(tag);
        }
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

/// Opaque generation token for one tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagVersion(String);

impl TagVersion {
    /// Generate a fresh, globally unique version token.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic digest over (data source identity, operation text, parameters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryFingerprint([u8; 32]);

impl QueryFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Final cache identity: `{prefix}:{hash(fingerprint, tag versions)}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: String,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

/// Fingerprints read operations.
///
/// Every field is length-prefixed before hashing so `("ab", "c")` and
/// `("a", "bc")` never collide.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheKeyDeriver;

impl CacheKeyDeriver {
    pub fn derive<P: Serialize>(
        source_identity: &str,
        operation: &str,
        parameters: &[P],
    ) -> QueryCacheResult<QueryFingerprint> {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, source_identity.as_bytes());
        write_field(&mut hasher, operation.as_bytes());
        hasher.update((parameters.len() as u64).to_be_bytes());

        for (index, parameter) in parameters.iter().enumerate() {
            let encoded = serde_json::to_vec(parameter).map_err(|e| {
                InputError::NonSerializableParameter {
                    index,
                    reason: e.to_string(),
                }
            })?;
            write_field(&mut hasher, &encoded);
        }

        Ok(QueryFingerprint(hasher.finalize().into()))
    }
}

/// Combine a fingerprint with resolved tag versions into a cache key.
///
/// Versions are folded in tag-name order, so the result is independent of
/// the order tags were supplied in.
pub fn compose_key(
    prefix: &str,
    fingerprint: &QueryFingerprint,
    versions: &BTreeMap<Tag, TagVersion>,
) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update((versions.len() as u64).to_be_bytes());
    for (tag, version) in versions {
        write_field(&mut hasher, tag.as_str().as_bytes());
        write_field(&mut hasher, version.as_str().as_bytes());
    }

    CacheKey {
        inner: format!("{}:{}", prefix, hex::encode(hasher.finalize())),
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
