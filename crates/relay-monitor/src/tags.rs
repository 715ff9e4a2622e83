//! Event tags and the insertion-ordered, identity-deduplicated tag set.
//!
//! A tag is a non-empty list of strings: `[name, value, extra...]`. Two tags
//! are the same tag when their name and first value match; trailing fields
//! do not participate in identity. The set keeps first-insertion order, which
//! becomes the on-wire order of the event's `tags` array.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// A single event tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Tag(Vec<String>);

impl Tag {
    /// Build a tag from a name and positional values.
    pub fn new<N, I, V>(name: N, values: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let mut fields = vec![name.into()];
        fields.extend(values.into_iter().map(Into::into));
        Self(fields)
    }

    /// A tag consisting only of its name.
    pub fn name_only(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    /// Tag name (first field).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0[0]
    }

    /// First positional value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Positional values (everything after the name).
    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.0[1..]
    }

    /// Deduplication identity: name plus first value.
    #[must_use]
    pub fn identity(&self) -> (&str, Option<&str>) {
        (self.name(), self.value())
    }

    /// All fields including the name.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl TryFrom<Vec<String>> for Tag {
    type Error = String;

    fn try_from(fields: Vec<String>) -> Result<Self, Self::Error> {
        if fields.is_empty() {
            return Err("tag must have at least a name".to_string());
        }
        Ok(Self(fields))
    }
}

impl From<Tag> for Vec<String> {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Ordered tags with identity-based deduplication.
///
/// Cloning produces an independent snapshot; per-tick events extend a clone
/// of the endpoint's base set and never touch the base set itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TagSet {
    tags: Vec<Tag>,
}

impl TagSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `tag` unless a tag with the same identity is already present.
    ///
    /// Returns `true` if the tag was inserted.
    pub fn append(&mut self, tag: Tag) -> bool {
        if self.tags.iter().any(|t| t.identity() == tag.identity()) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    /// Append every tag in order, skipping duplicates.
    pub fn extend_unique<I: IntoIterator<Item = Tag>>(&mut self, tags: I) {
        for tag in tags {
            self.append(tag);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.tags.iter()
    }

    /// First tag with the given name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.name() == name)
    }

    /// First values of every tag with the given name, in order.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == name)
            .filter_map(Tag::value)
    }

    /// Whether a tag with this identity exists.
    #[must_use]
    pub fn contains(&self, name: &str, value: &str) -> bool {
        self.tags
            .iter()
            .any(|t| t.identity() == (name, Some(value)))
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        let mut set = TagSet::new();
        set.extend_unique(iter);
        set
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

impl<'de> Deserialize<'de> for TagSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tags = Vec::<Tag>::deserialize(deserializer)?;
        Ok(tags.into_iter().collect())
    }
}
