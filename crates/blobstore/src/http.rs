use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::{BlobReceipt, BlobStore, BlobStoreError};

#[derive(Debug, Clone)]
pub struct HttpBlobStoreConfig {
    pub publisher_url: String,
    pub aggregator_url: String,
    pub timeout: Duration,
}

/// Client for a publisher/aggregator blob service: uploads go to the
/// publisher, reads and existence checks to the aggregator.
#[derive(Clone)]
pub struct HttpBlobStore {
    publisher_url: Url,
    aggregator_url: Url,
    http: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreResponse {
    #[serde(default)]
    newly_created: Option<NewlyCreated>,
    #[serde(default)]
    already_certified: Option<AlreadyCertified>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewlyCreated {
    blob_object: BlobObject,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobObject {
    blob_id: String,
    #[serde(default)]
    storage: Option<StorageInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageInfo {
    end_epoch: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlreadyCertified {
    blob_id: String,
    #[serde(default)]
    end_epoch: Option<u64>,
}

impl StoreResponse {
    fn into_receipt(self) -> Option<BlobReceipt> {
        if let Some(created) = self.newly_created {
            return Some(BlobReceipt {
                blob_id: created.blob_object.blob_id,
                end_epoch: created.blob_object.storage.map(|s| s.end_epoch),
            });
        }
        self.already_certified.map(|certified| BlobReceipt {
            blob_id: certified.blob_id,
            end_epoch: certified.end_epoch,
        })
    }
}

impl HttpBlobStore {
    pub fn new(config: HttpBlobStoreConfig) -> Result<Self, BlobStoreError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(BlobStoreError::Http)?;

        Ok(Self {
            publisher_url: parse_base_url(&config.publisher_url)?,
            aggregator_url: parse_base_url(&config.aggregator_url)?,
            http,
        })
    }

    fn blobs_url(&self) -> Result<Url, BlobStoreError> {
        with_segments(&self.publisher_url, &["v1", "blobs"])
    }

    /// The blob ID travels as a single percent-encoded path segment.
    fn blob_url(&self, blob_id: &str) -> Result<Url, BlobStoreError> {
        with_segments(&self.aggregator_url, &["v1", "blobs", blob_id])
    }
}

fn parse_base_url(raw: &str) -> Result<Url, BlobStoreError> {
    let url = Url::parse(raw.trim()).map_err(|err| BlobStoreError::InvalidUrl(err.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(BlobStoreError::InvalidUrl(format!(
            "{} cannot carry a path",
            url
        )));
    }
    Ok(url)
}

fn with_segments(base: &Url, segments: &[&str]) -> Result<Url, BlobStoreError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| BlobStoreError::InvalidUrl(format!("{} cannot carry a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, bytes: Vec<u8>, lease_epochs: u32) -> Result<BlobReceipt, BlobStoreError> {
        let resp = self
            .http
            .put(self.blobs_url()?)
            .query(&[("epochs", lease_epochs.max(1))])
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BlobStoreError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<StoreResponse>()
            .await
            .map_err(|_| BlobStoreError::InvalidResponse)?;

        let receipt = decoded
            .into_receipt()
            .ok_or(BlobStoreError::InvalidResponse)?;
        if docvault_contracts::validate_blob_id(&receipt.blob_id).is_err() {
            return Err(BlobStoreError::InvalidResponse);
        }
        Ok(receipt)
    }

    async fn get(&self, blob_id: &str) -> Result<Vec<u8>, BlobStoreError> {
        let resp = self.http.get(self.blob_url(blob_id)?).send().await?;

        match resp.status() {
            status if status.is_success() => Ok(resp.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(BlobStoreError::NotFound(blob_id.to_string())),
            status => Err(BlobStoreError::BadStatus(status)),
        }
    }

    async fn head(&self, blob_id: &str) -> Result<bool, BlobStoreError> {
        let resp = self.http.head(self.blob_url(blob_id)?).send().await?;

        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BlobStoreError::BadStatus(status)),
        }
    }
}
