//! Filesystem-backed object storage for uploaded submission files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use super::signature::{sign_object, OBJECT_SIGNATURE_PARAM};
use super::traits::BaseObjectStorage;
use crate::common::OwnerId;
use crate::domains::submissions::models::AttachmentRef;

pub const DEFAULT_BUCKET: &str = "submissions";

/// Stores objects under `<root>/<bucket>/<owner>/<uuid>-<name>` and hands
/// out URLs served by the `/files` route. With a URL secret set, every URL
/// carries a signature the route checks.
pub struct LocalObjectStorage {
    root: PathBuf,
    bucket: String,
    public_base_url: String,
    url_secret: Option<Vec<u8>>,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: DEFAULT_BUCKET.to_string(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            url_secret: None,
        }
    }

    pub fn with_url_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.url_secret = Some(secret.into());
        self
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

/// Reduce a client-supplied filename to a safe single path segment.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.chars().take(128).collect()
    }
}

pub fn resolve_mime(filename: &str, declared: Option<&str>) -> String {
    match declared.map(str::trim) {
        Some(mime) if !mime.is_empty() && mime != "application/octet-stream" => mime.to_string(),
        _ => mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

#[async_trait]
impl BaseObjectStorage for LocalObjectStorage {
    async fn put(
        &self,
        owner: OwnerId,
        filename: &str,
        mime: Option<&str>,
        bytes: Bytes,
    ) -> Result<AttachmentRef> {
        let name = sanitize_filename(filename);
        let key = format!("{}/{}-{}", owner, Uuid::now_v7(), name);
        let path = self.root.join(&self.bucket).join(&key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        tracing::debug!(owner_id = %owner, key = %key, size = bytes.len(), "stored upload");

        Ok(AttachmentRef {
            bucket: self.bucket.clone(),
            key,
            mime: resolve_mime(filename, mime),
            size: bytes.len() as u64,
        })
    }

    async fn read(&self, attachment: &AttachmentRef) -> Result<Bytes> {
        let path = self.root.join(&attachment.bucket).join(&attachment.key);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Bytes::from(bytes))
    }

    fn file_url(&self, attachment: &AttachmentRef) -> String {
        let path = format!("{}/{}", attachment.bucket, attachment.key);
        match &self.url_secret {
            Some(secret) => format!(
                "{}/files/{}?{}={}",
                self.public_base_url,
                path,
                OBJECT_SIGNATURE_PARAM,
                sign_object(&path, secret)
            ),
            None => format!("{}/files/{}", self.public_base_url, path),
        }
    }
}
