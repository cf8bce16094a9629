use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, error};

use super::{ObjectStore, ObjectStoreError, StoredFile, validate_key, with_timeout};

/// S3-compatible bucket (AWS or MinIO via a custom endpoint).
pub struct S3ObjectStore {
    client: Client,
    bucket_name: String,
    timeout_ms: u64,
}

impl S3ObjectStore {
    /// Credentials and region come from the standard AWS environment chain.
    /// A custom `endpoint` switches to path-style addressing for MinIO.
    pub async fn new(bucket_name: String, endpoint: Option<String>, timeout_ms: u64) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket_name,
            timeout_ms: timeout_ms.max(1),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, file: StoredFile) -> Result<(), ObjectStoreError> {
        validate_key(&file.name)?;
        let content_type = mime_guess::from_path(&file.name)
            .first_or_octet_stream()
            .to_string();
        let key = file.name.clone();
        let size = file.size;
        debug!(bucket = %self.bucket_name, key = %key, size, "s3 put object");

        with_timeout(self.timeout_ms, async {
            self.client
                .put_object()
                .bucket(&self.bucket_name)
                .key(&key)
                .content_type(content_type)
                .content_length(size as i64)
                .body(ByteStream::from(file.bytes))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| {
                    error!(bucket = %self.bucket_name, key = %key, reason = ?e, "s3 put failed");
                    ObjectStoreError::Backend(e.to_string())
                })
        })
        .await
    }

    async fn get(&self, name: &str) -> Result<StoredFile, ObjectStoreError> {
        validate_key(name)?;
        with_timeout(self.timeout_ms, async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket_name)
                .key(name)
                .send()
                .await
                .map_err(|e| {
                    if e.as_service_error()
                        .is_some_and(|service_error| service_error.is_no_such_key())
                    {
                        return ObjectStoreError::NotFound(name.to_string());
                    }
                    error!(bucket = %self.bucket_name, key = %name, reason = ?e, "s3 get failed");
                    ObjectStoreError::Backend(e.to_string())
                })?;
            let body = output
                .body
                .collect()
                .await
                .map_err(|e| ObjectStoreError::Backend(format!("collect body: {e}")))?;
            Ok(StoredFile::new(name, body.to_vec()))
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError> {
        validate_key(name)?;
        with_timeout(self.timeout_ms, async {
            self.client
                .delete_object()
                .bucket(&self.bucket_name)
                .key(name)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| {
                    error!(bucket = %self.bucket_name, key = %name, reason = ?e, "s3 delete failed");
                    ObjectStoreError::Backend(e.to_string())
                })
        })
        .await
    }

    fn driver_name(&self) -> &'static str {
        "s3"
    }
}
