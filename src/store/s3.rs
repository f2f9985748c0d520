//! S3-compatible store using the AWS SDK.
//!
//! The SDK is async; the store owns a current-thread tokio runtime and blocks
//! on it from the transport thread, so the rest of the pipeline stays
//! synchronous.

use super::{ObjectRef, ObjectStore, StoreError, StoreResult};
use crate::config::S3Config;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use std::io::{self, Read, Write};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// Part size for multipart uploads (8 MiB; S3 needs at least 5 MiB).
const PART_SIZE: usize = 8 * 1024 * 1024;

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::S3(Box::new(err))
}

/// Convert an SDK error, mapping 404 to NotFound.
fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, object: &ObjectRef) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
        if service_err.raw().status().as_u16() == 404 {
            return StoreError::NotFound(object.to_string());
        }
    }
    map_s3_operation_error(err)
}

pub struct S3Store {
    client: Client,
    runtime: Runtime,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store").finish_non_exhaustive()
    }
}

impl S3Store {
    pub fn new(config: &S3Config) -> StoreResult<Self> {
        if config.access_key_id.is_some() ^ config.secret_access_key.is_some() {
            return Err(StoreError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());
        let shared = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(region))
                .load(),
        );

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "tarlift-config",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            let lower = endpoint.to_ascii_lowercase();
            let url = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("http://{}", endpoint)
            };
            builder = builder.endpoint_url(url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            runtime,
        })
    }

    async fn multipart_upload(
        &self,
        object: &ObjectRef,
        first: Vec<u8>,
        source: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Protocol("multipart upload without an id".into()))?
            .to_string();

        let mut parts = Vec::new();
        let result = self
            .send_parts(object, &upload_id, first, source, progress, &mut parts)
            .await;

        let total = match result {
            Ok(total) => total,
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&object.bucket)
                    .key(&object.key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("failed to abort multipart upload {}: {}", upload_id, abort_err);
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(total)
    }

    async fn send_parts(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        first: Vec<u8>,
        source: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
        parts: &mut Vec<CompletedPart>,
    ) -> StoreResult<u64> {
        let mut part = first;
        let mut total = 0u64;
        let mut part_number = 1;
        loop {
            total += part.len() as u64;
            let output = self
                .client
                .upload_part()
                .bucket(&object.bucket)
                .key(&object.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            parts.push(
                CompletedPart::builder()
                    .e_tag(output.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            debug!("Uploaded part {} of {}", part_number, object);
            part_number += 1;

            part = read_part(source, progress)?;
            if part.is_empty() {
                return Ok(total);
            }
        }
    }
}

/// Fill up to one part from `source`, reporting each read.
fn read_part(source: &mut dyn Read, progress: &mut dyn FnMut(u64)) -> io::Result<Vec<u8>> {
    let mut part = vec![0u8; PART_SIZE];
    let mut filled = 0;
    while filled < PART_SIZE {
        match source.read(&mut part[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                progress(n as u64);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    part.truncate(filled);
    Ok(part)
}

impl ObjectStore for S3Store {
    fn upload(
        &self,
        object: &ObjectRef,
        source: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        let first = read_part(source, progress)?;
        if first.len() < PART_SIZE {
            // Fits in one request.
            let len = first.len() as u64;
            self.runtime
                .block_on(
                    self.client
                        .put_object()
                        .bucket(&object.bucket)
                        .key(&object.key)
                        .body(ByteStream::from(first))
                        .send(),
                )
                .map_err(map_s3_operation_error)?;
            return Ok(len);
        }
        self.runtime
            .block_on(self.multipart_upload(object, first, source, progress))
    }

    fn download(
        &self,
        object: &ObjectRef,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        self.runtime.block_on(async {
            let mut output = self
                .client
                .get_object()
                .bucket(&object.bucket)
                .key(&object.key)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, object))?;

            let mut total = 0u64;
            while let Some(chunk) = output
                .body
                .try_next()
                .await
                .map_err(|e| StoreError::S3(Box::new(e)))?
            {
                sink.write_all(&chunk)?;
                total += chunk.len() as u64;
                progress(chunk.len() as u64);
            }
            sink.flush()?;
            Ok(total)
        })
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
