use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use bytes::Bytes;
use uuid::Uuid;

/// A fetched binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub data: Bytes,
    pub content_type: Option<String>,
}

impl Blob {
    pub fn new(data: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            content_type,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A local handle to a [`Blob`], valid until it is revoked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUrl(String);

impl ObjectUrl {
    const PREFIX: &'static str = "blob:blobcache/";

    fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ObjectUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of live object URLs.
///
/// Every URL created here holds on to its blob until [`revoke`](Self::revoke) is called.
#[derive(Debug, Default)]
pub struct ObjectUrls {
    blobs: Mutex<HashMap<ObjectUrl, Blob>>,
}

impl ObjectUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `blob` under a fresh object URL.
    pub fn create(&self, blob: Blob) -> ObjectUrl {
        let url = ObjectUrl::generate();
        self.blobs.lock().unwrap().insert(url.clone(), blob);
        url
    }

    /// Returns the blob behind `url`, if it has not been revoked.
    pub fn resolve(&self, url: &ObjectUrl) -> Option<Blob> {
        self.blobs.lock().unwrap().get(url).cloned()
    }

    /// Releases `url` and its blob. Returns `false` if it was not live.
    pub fn revoke(&self, url: &ObjectUrl) -> bool {
        self.blobs.lock().unwrap().remove(url).is_some()
    }

    /// The number of live object URLs.
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
