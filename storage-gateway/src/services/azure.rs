//! Azure Blob Storage backend over the REST API.
//!
//! Calls authenticate with narrowly scoped SAS grants minted per request.
//! Uploads go through Put Block / Put Block List so memory stays bounded
//! by `block_bytes * (max_in_flight + 1)` regardless of object size.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::config::StorageConfig;
use crate::models::StoredObject;
use crate::services::object_store::{ByteStream, ListSegment, ObjectStore, StoreError};
use crate::services::sas::{
    SasResource, SasSigner, PERMISSION_DELETE, PERMISSION_LIST, PERMISSION_WRITE, SAS_VERSION,
};

const VERSION_HEADER: &str = "x-ms-version";
const ERROR_CODE_HEADER: &str = "x-ms-error-code";
const CONTENT_TYPE_HEADER: &str = "x-ms-blob-content-type";

pub struct AzureBlobStore {
    client: Client,
    signer: SasSigner,
    block_bytes: usize,
    max_in_flight: usize,
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    blobs: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Last-Modified")]
    last_modified: String,
    #[serde(rename = "Content-Length")]
    content_length: u64,
}

impl AzureBlobStore {
    pub fn new(signer: SasSigner, config: &StorageConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StoreError::Backend(e.into()))?;

        Ok(Self {
            client,
            signer,
            block_bytes: config.upload_block_bytes,
            max_in_flight: config.upload_max_in_flight,
            page_size: config.list_page_size,
        })
    }

    fn signed_url(
        &self,
        resource: SasResource,
        name: Option<&str>,
        permissions: &str,
    ) -> Result<Url, StoreError> {
        self.signer
            .grant(resource, name, permissions)
            .map(|grant| grant.url)
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn list_page(
        &self,
        marker: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListSegment, StoreError> {
        let mut url = self.signed_url(SasResource::Container, None, PERMISSION_LIST)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("restype", "container").append_pair("comp", "list");
            if let Some(marker) = marker.filter(|m| !m.is_empty()) {
                query.append_pair("marker", marker);
            }
            if let Some(max_results) = max_results {
                query.append_pair("maxresults", &max_results.to_string());
            }
        }

        let response = self
            .client
            .get(url)
            .header(VERSION_HEADER, SAS_VERSION)
            .send()
            .await
            .map_err(transport_error)?;
        let body = check_status(response, "container")
            .await?
            .text()
            .await
            .map_err(transport_error)?;

        parse_list_response(&body)
    }

    async fn put_block(&self, mut url: Url, block_id: String, data: Bytes) -> Result<(), StoreError> {
        url.query_pairs_mut()
            .append_pair("comp", "block")
            .append_pair("blockid", &block_id);

        let response = self
            .client
            .put(url)
            .header(VERSION_HEADER, SAS_VERSION)
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, &block_id).await?;
        Ok(())
    }

    async fn commit_blocks(
        &self,
        mut url: Url,
        name: &str,
        block_ids: &[String],
        content_type: Option<&str>,
    ) -> Result<(), StoreError> {
        url.query_pairs_mut().append_pair("comp", "blocklist");

        let mut request = self
            .client
            .put(url)
            .header(VERSION_HEADER, SAS_VERSION)
            .body(block_list_xml(block_ids));
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE_HEADER, content_type);
        }

        let response = request.send().await.map_err(transport_error)?;
        check_status(response, name).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    async fn list_segment(&self, marker: Option<&str>) -> Result<ListSegment, StoreError> {
        self.list_page(marker, self.page_size).await
    }

    async fn put_stream<'a>(
        &self,
        name: &str,
        content_type: Option<&str>,
        mut body: ByteStream<'a>,
    ) -> Result<u64, StoreError> {
        let url = self.signed_url(SasResource::Blob, Some(name), PERMISSION_WRITE)?;

        let mut in_flight: FuturesUnordered<BoxFuture<'_, Result<(), StoreError>>> =
            FuturesUnordered::new();
        let mut block_ids: Vec<String> = Vec::new();
        let mut buffer = BytesMut::with_capacity(self.block_bytes);
        let mut total: u64 = 0;

        // Staged blocks must keep uploading while the next chunk is awaited.
        let mut body_open = true;
        loop {
            tokio::select! {
                Some(result) = in_flight.next(), if !in_flight.is_empty() => result?,
                chunk = body.next(), if body_open => {
                    let Some(chunk) = chunk else {
                        body_open = false;
                        continue;
                    };
                    let mut chunk = chunk?;
                    total += chunk.len() as u64;

                    while !chunk.is_empty() {
                        let take = (self.block_bytes - buffer.len()).min(chunk.len());
                        buffer.extend_from_slice(&chunk.split_to(take));

                        if buffer.len() == self.block_bytes {
                            while in_flight.len() >= self.max_in_flight {
                                match in_flight.next().await {
                                    Some(result) => result?,
                                    None => break,
                                }
                            }
                            let id = block_id(block_ids.len());
                            block_ids.push(id.clone());
                            in_flight.push(Box::pin(self.put_block(
                                url.clone(),
                                id,
                                buffer.split().freeze(),
                            )));
                        }
                    }
                }
                else => break,
            }
        }

        if !buffer.is_empty() {
            let id = block_id(block_ids.len());
            block_ids.push(id.clone());
            in_flight.push(Box::pin(self.put_block(
                url.clone(),
                id,
                buffer.split().freeze(),
            )));
        }

        while let Some(result) = in_flight.next().await {
            result?;
        }

        self.commit_blocks(url, name, &block_ids, content_type).await?;

        tracing::debug!(
            object = %name,
            blocks = block_ids.len(),
            bytes = total,
            "Committed block upload"
        );

        Ok(total)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let url = self.signed_url(SasResource::Blob, Some(name), PERMISSION_DELETE)?;

        let response = self
            .client
            .delete(url)
            .header(VERSION_HEADER, SAS_VERSION)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, name).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.list_page(None, Some(1)).await.map(|_| ())
    }
}

/// Block ids must all have the same length within one blob.
fn block_id(index: usize) -> String {
    STANDARD.encode(format!("block-{:08}", index))
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

fn parse_list_response(body: &str) -> Result<ListSegment, StoreError> {
    let results: EnumerationResults = quick_xml::de::from_str(body)
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Invalid list response: {}", e)))?;

    let items = results
        .blobs
        .blobs
        .into_iter()
        .map(|blob| {
            let last_modified = DateTime::parse_from_rfc2822(&blob.properties.last_modified)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    StoreError::Backend(anyhow::anyhow!(
                        "Invalid Last-Modified {:?}: {}",
                        blob.properties.last_modified,
                        e
                    ))
                })?;
            Ok(StoredObject {
                name: blob.name,
                size: blob.properties.content_length,
                last_modified,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(ListSegment {
        items,
        next_marker: results.next_marker.filter(|m| !m.trim().is_empty()),
    })
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout(format!("object store: {}", err))
    } else {
        StoreError::Backend(anyhow::anyhow!("Object store request failed: {}", err))
    }
}

async fn check_status(response: Response, subject: &str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = response
        .headers()
        .get(ERROR_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    if status == StatusCode::NOT_FOUND && code != "ContainerNotFound" {
        return Err(StoreError::NotFound(subject.to_string()));
    }

    Err(StoreError::Backend(anyhow::anyhow!(
        "Object store returned {} ({}) for {}",
        status,
        code,
        subject
    )))
}
