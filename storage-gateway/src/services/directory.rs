use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::models::FileEntry;
use crate::services::object_store::{ByteStream, ObjectStore, StoreError};
use crate::services::sas::{validate_object_name, SasSigner};
use crate::services::timeout::within;

/// Full container listing. `skipped` counts objects whose URL could not be
/// signed; they are left out of `files` instead of failing the request.
#[derive(Debug, Default)]
pub struct Listing {
    pub files: Vec<FileEntry>,
    pub skipped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid file name")]
    InvalidName,

    #[error("Error generating file access URL: {0}")]
    Signing(String),
}

impl From<DirectoryError> for service_core::error::AppError {
    fn from(err: DirectoryError) -> Self {
        use service_core::error::AppError;
        match err {
            DirectoryError::Store(e) => e.into(),
            DirectoryError::InvalidName => AppError::BadRequest(anyhow::anyhow!("Invalid file name")),
            DirectoryError::Signing(e) => AppError::InternalError(anyhow::anyhow!(
                "Error generating file access URL: {}",
                e
            )),
        }
    }
}

#[derive(Clone)]
pub struct ObjectDirectory {
    store: Arc<dyn ObjectStore>,
    signer: SasSigner,
    timeout: Duration,
}

impl ObjectDirectory {
    pub fn new(store: Arc<dyn ObjectStore>, signer: SasSigner, timeout: Duration) -> Self {
        Self {
            store,
            signer,
            timeout,
        }
    }

    /// Walks every segment of the container, signing each entry.
    pub async fn list(&self) -> Result<Listing, DirectoryError> {
        let mut listing = Listing::default();
        let mut marker: Option<String> = None;
        let mut segments = 0usize;

        loop {
            let segment = within(
                self.timeout,
                "object store",
                self.store.list_segment(marker.as_deref()),
            )
            .await?;
            segments += 1;

            for item in segment.items {
                match self.signer.issue(&item.name) {
                    Ok(grant) => listing.files.push(FileEntry {
                        url: grant.url.to_string(),
                        name: item.name,
                        size: item.size,
                        upload_date: item.last_modified,
                    }),
                    Err(e) => {
                        tracing::warn!(object = %item.name, error = %e, "Skipping unsignable object");
                        listing.skipped += 1;
                    }
                }
            }

            match segment.next_marker {
                Some(next) if Some(&next) != marker.as_ref() => marker = Some(next),
                Some(next) => {
                    return Err(StoreError::Backend(anyhow::anyhow!(
                        "Listing did not advance past marker {:?}",
                        next
                    ))
                    .into());
                }
                None => break,
            }
        }

        if listing.skipped > 0 {
            metrics::counter!("listing_skipped_entries_total").increment(listing.skipped as u64);
        }
        tracing::debug!(
            files = listing.files.len(),
            skipped = listing.skipped,
            segments = segments,
            "Listed container"
        );

        Ok(listing)
    }

    /// Streams `body` into the container under `name` and returns a signed
    /// read URL for it. Nothing is signed if the write fails.
    pub async fn upload<'a>(
        &self,
        name: &str,
        content_type: Option<&str>,
        body: ByteStream<'a>,
    ) -> Result<FileEntry, DirectoryError> {
        validate_object_name(name).map_err(|_| DirectoryError::InvalidName)?;

        let size = within(
            self.timeout,
            "object store",
            self.store.put_stream(name, content_type, body),
        )
        .await?;
        metrics::counter!("upload_bytes_total").increment(size);

        let grant = self
            .signer
            .issue(name)
            .map_err(|e| DirectoryError::Signing(e.to_string()))?;

        tracing::info!(object = %name, bytes = size, "File uploaded");

        Ok(FileEntry {
            name: name.to_string(),
            url: grant.url.to_string(),
            size,
            upload_date: Utc::now(),
        })
    }

    pub async fn delete(&self, name: &str) -> Result<(), DirectoryError> {
        validate_object_name(name).map_err(|_| DirectoryError::InvalidName)?;

        within(self.timeout, "object store", self.store.delete(name)).await?;

        tracing::info!(object = %name, "File deleted");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), DirectoryError> {
        within(self.timeout, "object store", self.store.health_check()).await?;
        Ok(())
    }
}
