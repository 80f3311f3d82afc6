//! Maps resource URLs to the domain objects they belong to.
//!
//! Realtime notifications are keyed by an [`ObjectIdentifier`], while the cache is keyed by
//! resource URL. The table in this module bridges the two, so that a failed fetch can wait for
//! an update of exactly the object it was trying to load.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of domain object a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    TaskAttachment,
    TopicAttachment,
    MessageAttachment,
    ProjectPicture,
    UserPicture,
}

impl AsRef<str> for ObjectType {
    fn as_ref(&self) -> &str {
        match self {
            Self::TaskAttachment => "task_attachment",
            Self::TopicAttachment => "topic_attachment",
            Self::MessageAttachment => "message_attachment",
            Self::ProjectPicture => "project_picture",
            Self::UserPicture => "user_picture",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Identifies a domain object by its type and id.
///
/// Two identifiers are equal only if both the type and the id match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentifier {
    pub object_type: ObjectType,
    pub object_id: String,
}

impl ObjectIdentifier {
    pub fn new(object_type: ObjectType, object_id: impl Into<String>) -> Self {
        Self {
            object_type,
            object_id: object_id.into(),
        }
    }

    /// Resolves the object a resource URL belongs to.
    ///
    /// The patterns are tried in order and the first match wins.
    pub fn from_resource_url(url: &str) -> Result<Self, UnresolvedIdentity> {
        RESOURCE_PATTERNS
            .iter()
            .find_map(|pattern| pattern.captures(url))
            .ok_or_else(|| UnresolvedIdentity(url.to_owned()))
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// No known resource pattern matches the URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no object identity for resource `{0}`")]
pub struct UnresolvedIdentity(pub String);

/// An id is a single path segment.
const ID_SEGMENT: &str = "[^/?#]+";

struct ResourcePattern {
    regex: Regex,
    object_type: ObjectType,
}

impl ResourcePattern {
    fn new(path: &str, object_type: ObjectType) -> Self {
        let pattern = format!(r"/v\d+/{}", path.replace("{id}", &format!("({ID_SEGMENT})")));
        Self {
            // The table is static, a broken pattern is a programming error.
            regex: Regex::new(&pattern).expect("invalid resource pattern"),
            object_type,
        }
    }

    fn captures(&self, url: &str) -> Option<ObjectIdentifier> {
        let id = self.regex.captures(url)?.get(1)?;
        Some(ObjectIdentifier::new(self.object_type, id.as_str()))
    }
}

static RESOURCE_PATTERNS: Lazy<Vec<ResourcePattern>> = Lazy::new(|| {
    vec![
        ResourcePattern::new("projects/tasks/attachments/{id}", ObjectType::TaskAttachment),
        ResourcePattern::new(
            "projects/tasks/topics/attachments/{id}",
            ObjectType::TopicAttachment,
        ),
        ResourcePattern::new(
            "projects/tasks/topics/messages/attachments/{id}",
            ObjectType::MessageAttachment,
        ),
        ResourcePattern::new("projects/[^/]+/picture/{id}", ObjectType::ProjectPicture),
        ResourcePattern::new("users/[^/]+/picture/{id}", ObjectType::UserPicture),
    ]
});
