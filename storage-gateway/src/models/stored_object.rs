use chrono::{DateTime, Utc};

/// Object metadata as reported by the backing store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// A stored object paired with a freshly signed read URL.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub url: String,
    pub size: u64,
    pub upload_date: DateTime<Utc>,
}
