use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::FileEntry;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub name: String,
    pub url: String,
    pub size: u64,
    pub upload_date: DateTime<Utc>,
}

impl From<FileEntry> for FileResponse {
    fn from(entry: FileEntry) -> Self {
        Self {
            name: entry.name,
            url: entry.url,
            size: entry.size,
            upload_date: entry.upload_date,
        }
    }
}
