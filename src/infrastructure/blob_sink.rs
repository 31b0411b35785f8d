//! Object-storage sink (spec.md §6): uploads originals and thumbnails to
//! Cloudflare R2 through its S3-compatible API. Grounded in the original
//! `StorageService` (boto3 `upload_fileobj`/custom endpoint) and, for the
//! Rust crate choice, `aws-sdk-s3` as used for drive storage in the example
//! pack, configured by hand rather than through `aws-config` since the R2
//! endpoint/credentials are static and known up front.
//! `BlobSink` is a synchronous trait (C7 workers are plain
//! threads, not async tasks), so each call blocks on a dedicated Tokio
//! runtime the sink owns.

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::runtime::Runtime;

use crate::domain::{BlobSink, CatalogError};

pub struct R2BlobSink {
    client: Client,
    bucket: String,
    runtime: Runtime,
}

impl R2BlobSink {
    pub fn new(
        account_id: &str,
        access_key: &str,
        secret_key: &str,
        bucket: &str,
    ) -> Result<Self, CatalogError> {
        let runtime = Runtime::new()
            .map_err(|e| CatalogError::Blob(format!("failed to start upload runtime: {e}")))?;

        let endpoint = format!("https://{account_id}.r2.cloudflarestorage.com");
        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-static");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(Region::new("auto"))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
            runtime,
        })
    }
}

impl BlobSink for R2BlobSink {
    fn put(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<(), CatalogError> {
        let body = ByteStream::from(bytes.to_vec());
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type(content_type)
                    .body(body)
                    .send(),
            )
            .map(|_| ())
            .map_err(|e| CatalogError::Blob(format!("put {key} failed: {e}")))
    }

    fn delete(&self, key: &str) {
        let result = self.runtime.block_on(
            self.client.delete_object().bucket(&self.bucket).key(key).send(),
        );
        if let Err(e) = result {
            tracing::warn!(key, error = %e, "best-effort blob delete failed");
        }
    }

    fn enabled(&self) -> bool {
        true
    }
}
