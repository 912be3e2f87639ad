//! S3-compatible blob backend via the AWS SDK.
//!
//! All tenants share one physical bucket; isolation comes from the
//! `{tenant}/...` key prefix. Non-AWS endpoints (MinIO, localstack) are
//! supported through `endpoint` + `force_path_style`.
//!
//! SDK failures map onto [`BlobError`] by HTTP status: 404 → `NotFound`,
//! 403 → `AccessDenied`, 409/412 → `Conflict`, everything transport-shaped
//! → `BackendUnavailable` (retryable).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use objectstack_core::{ByteRange, S3Config};

use crate::error::BlobError;
use crate::{
    BlobMetadata, BlobObject, BlobPayload, BlobStore, MAX_KEYS_PER_DELETE, UploadedPart,
    physical_key,
};

/// Characters escaped in `x-amz-copy-source`; `/` stays a separator.
const COPY_SOURCE_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// S3-backed [`BlobStore`].
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Build a store from configuration, loading credentials from the
    /// default AWS provider chain.
    pub async fn new(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }

    /// Build a store around an existing client (tests, shared clients).
    #[must_use]
    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Fetch metadata for a physical key.
    async fn stat(&self, physical: &str) -> Result<BlobMetadata, BlobError> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(physical)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, physical))?;

        Ok(BlobMetadata {
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            etag: trim_etag(resp.e_tag()),
            mimetype: resp
                .content_type()
                .unwrap_or(crate::DEFAULT_CONTENT_TYPE)
                .to_owned(),
            cache_control: resp
                .cache_control()
                .unwrap_or(crate::DEFAULT_CACHE_CONTROL)
                .to_owned(),
            last_modified: convert_time(resp.last_modified()),
            http_status_code: 200,
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn read(
        &self,
        key: &str,
        version: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<BlobObject, BlobError> {
        let physical = physical_key(key, version);
        let mut req = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&physical);
        if let Some(r) = range {
            req = req.range(r.to_http_header());
        }

        let resp = match cancel.run_until_cancelled(req.send()).await {
            Some(result) => result.map_err(|e| map_sdk_error(e, &physical))?,
            None => return Err(BlobError::Cancelled),
        };

        let metadata = BlobMetadata {
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            etag: trim_etag(resp.e_tag()),
            mimetype: resp
                .content_type()
                .unwrap_or(crate::DEFAULT_CONTENT_TYPE)
                .to_owned(),
            cache_control: resp
                .cache_control()
                .unwrap_or(crate::DEFAULT_CACHE_CONTROL)
                .to_owned(),
            last_modified: convert_time(resp.last_modified()),
            http_status_code: if range.is_some() { 206 } else { 200 },
        };

        let stream = ReaderStream::new(resp.body.into_async_read())
            .take_until(cancel.clone().cancelled_owned());

        trace!(key, version, status = metadata.http_status_code, "opened s3 object");
        Ok(BlobObject {
            metadata,
            stream: Box::pin(stream),
        })
    }

    async fn write(
        &self,
        key: &str,
        version: &str,
        payload: BlobPayload,
        content_type: &str,
        cache_control: &str,
        user_metadata: Option<&HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Result<BlobMetadata, BlobError> {
        let physical = physical_key(key, version);
        let size = payload.len();

        let body = match payload {
            BlobPayload::InMemory(bytes) => SdkByteStream::from(bytes),
            BlobPayload::Spilled { path, .. } => SdkByteStream::from_path(&path).await.map_err(
                |e| BlobError::Internal(anyhow::anyhow!("open spill file {}: {e}", path.display())),
            )?,
        };

        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&physical)
            .body(body)
            .content_type(content_type)
            .cache_control(cache_control);
        if let Some(meta) = user_metadata {
            for (k, v) in meta {
                req = req.metadata(k, v);
            }
        }

        let resp = match cancel.run_until_cancelled(req.send()).await {
            Some(result) => result.map_err(|e| map_sdk_error(e, &physical))?,
            None => return Err(BlobError::Cancelled),
        };

        debug!(key, version, size, "stored s3 object");
        Ok(BlobMetadata {
            size,
            etag: trim_etag(resp.e_tag()),
            mimetype: content_type.to_owned(),
            cache_control: cache_control.to_owned(),
            last_modified: Utc::now(),
            http_status_code: 200,
        })
    }

    async fn head(&self, key: &str, version: &str) -> Result<BlobMetadata, BlobError> {
        self.stat(&physical_key(key, version)).await
    }

    async fn copy(
        &self,
        src_key: &str,
        src_version: &str,
        dst_key: &str,
        dst_version: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobMetadata, BlobError> {
        let src_physical = physical_key(src_key, src_version);
        let dst_physical = physical_key(dst_key, dst_version);
        let copy_source = format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(&src_physical, COPY_SOURCE_ENCODE)
        );

        let send = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(&dst_physical)
            .copy_source(copy_source)
            .send();
        match cancel.run_until_cancelled(send).await {
            Some(result) => {
                result.map_err(|e| map_sdk_error(e, &src_physical))?;
            }
            None => return Err(BlobError::Cancelled),
        }

        debug!(src = src_physical, dst = dst_physical, "copied s3 object");
        self.stat(&dst_physical).await
    }

    async fn delete(&self, key: &str, version: &str) -> Result<(), BlobError> {
        let physical = physical_key(key, version);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&physical)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &physical))?;
        trace!(key, version, "deleted s3 object");
        Ok(())
    }

    async fn delete_many(&self, keys: Vec<String>) -> Result<(), BlobError> {
        for chunk in keys.chunks(MAX_KEYS_PER_DELETE) {
            let objects = chunk
                .iter()
                .map(|k| {
                    ObjectIdentifier::builder()
                        .key(k)
                        .build()
                        .map_err(|e| BlobError::Internal(anyhow::anyhow!("object id: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|e| BlobError::Internal(anyhow::anyhow!("delete request: {e}")))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, "delete_many"))?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, max_keys: Option<usize>) -> Result<Vec<String>, BlobError> {
        let limit = max_keys.unwrap_or(usize::MAX);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| map_sdk_error(e, prefix))?;

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_owned());
                    if keys.len() >= limit {
                        return Ok(keys);
                    }
                }
            }

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_owned());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn create_multipart(
        &self,
        key: &str,
        version: &str,
        content_type: &str,
        cache_control: &str,
    ) -> Result<String, BlobError> {
        let physical = physical_key(key, version);
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&physical)
            .content_type(content_type)
            .cache_control(cache_control)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &physical))?;

        let upload_id = resp
            .upload_id()
            .ok_or_else(|| BlobError::Internal(anyhow::anyhow!("no upload id returned")))?
            .to_owned();
        debug!(key, version, upload_id, "created s3 multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<UploadedPart, BlobError> {
        let physical = physical_key(key, version);
        let send = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&physical)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(SdkByteStream::from(body))
            .send();

        let resp = match cancel.run_until_cancelled(send).await {
            Some(result) => result.map_err(|e| map_sdk_error(e, &physical))?,
            None => return Err(BlobError::Cancelled),
        };

        Ok(UploadedPart {
            part_number,
            etag: trim_etag(resp.e_tag()),
        })
    }

    async fn list_parts(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, BlobError> {
        let physical = physical_key(key, version);
        let resp = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(&physical)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &physical))?;

        Ok(resp
            .parts()
            .iter()
            .filter_map(|p| {
                Some(UploadedPart {
                    part_number: p.part_number()?,
                    etag: p.e_tag()?.trim_matches('"').to_owned(),
                })
            })
            .collect())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<BlobMetadata, BlobError> {
        let physical = physical_key(key, version);
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        let multipart = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&physical)
            .upload_id(upload_id)
            .multipart_upload(multipart)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &physical))?;

        debug!(key, version, upload_id, parts = parts.len(), "completed s3 multipart upload");
        self.stat(&physical).await
    }

    async fn abort_multipart(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
    ) -> Result<(), BlobError> {
        let physical = physical_key(key, version);
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&physical)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &physical))?;
        Ok(())
    }

    async fn private_url(
        &self,
        key: &str,
        version: &str,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        let physical = physical_key(key, version);
        let presign_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| BlobError::Internal(anyhow::anyhow!("presign config: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&physical)
            .presigned(presign_config)
            .await
            .map_err(|e| map_sdk_error(e, &physical))?;

        Ok(presigned.uri().to_string())
    }

    fn supports_conditional_put(&self) -> bool {
        // If-None-Match on PUT is part of the S3 API surface this adapter
        // targets; endpoints that lack it reject with 501 at runtime.
        true
    }

    async fn get_raw(&self, key: &str) -> Result<Bytes, BlobError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        let aggregated = resp
            .body
            .collect()
            .await
            .map_err(|e| BlobError::BackendUnavailable {
                message: format!("read body: {e}"),
            })?;
        Ok(aggregated.into_bytes())
    }

    async fn put_raw(&self, key: &str, body: Bytes) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(SdkByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    async fn put_raw_if_absent(&self, key: &str, body: Bytes) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(SdkByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    async fn delete_raw(&self, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }
}

/// Strip the quotes S3 wraps entity tags in.
fn trim_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_owned()
}

/// SDK timestamps to chrono.
fn convert_time(time: Option<&aws_smithy_types::DateTime>) -> DateTime<Utc> {
    time.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

/// Map an SDK error onto the adapter taxonomy by HTTP status.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, key: &str) -> BlobError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            match status {
                404 => BlobError::NotFound {
                    key: key.to_owned(),
                },
                403 => BlobError::AccessDenied,
                409 | 412 => BlobError::Conflict {
                    key: key.to_owned(),
                },
                _ => BlobError::BackendUnavailable {
                    message: format!(
                        "s3 status {status}: {}",
                        ctx.err().message().unwrap_or("unknown error")
                    ),
                },
            }
        }
        other @ (SdkError::TimeoutError(_)
        | SdkError::DispatchFailure(_)
        | SdkError::ResponseError(_)) => BlobError::BackendUnavailable {
            message: other.to_string(),
        },
        other => BlobError::Internal(anyhow::Error::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_encode_copy_source_preserving_separators() {
        let encoded = utf8_percent_encode("t1/b/dir/a file+x.png/v1", COPY_SOURCE_ENCODE)
            .to_string();
        assert_eq!(encoded, "t1/b/dir/a%20file%2Bx.png/v1");
    }

    #[test]
    fn test_should_trim_quoted_etags() {
        assert_eq!(trim_etag(Some("\"abc123\"")), "abc123");
        assert_eq!(trim_etag(None), "");
    }

    #[test]
    fn test_should_convert_sdk_timestamps() {
        let dt = aws_smithy_types::DateTime::from_secs(1_700_000_000);
        let converted = convert_time(Some(&dt));
        assert_eq!(converted.timestamp(), 1_700_000_000);
    }
}
