//! S3-compatible implementation of the [`ObjectStore`] capability.
//!
//! Works against AWS S3 in production and against MinIO in development
//! (path-style addressing with the emulator's static credentials; see
//! [`dev_sdk_config`]). Startup primes the bucket and its lifecycle rule.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
    LifecycleRuleFilter,
};
use eyre::Context as _;
use vigil_common::Environment;
use vigil_common::profile::StorageSettings;

use crate::{FRAMES_PREFIX, ObjectInfo, ObjectStore, StorageError};

const LIFECYCLE_RULE_ID: &str = "auto-expire-frames";

/// S3 client wrapper.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    provider: String,
}

impl S3ObjectStore {
    /// Initializes the store: builds the client, makes sure the bucket
    /// exists and carries the retention lifecycle rule.
    pub async fn init(
        aws_config: &aws_config::SdkConfig,
        settings: &StorageSettings,
        force_path_style: bool,
    ) -> eyre::Result<Self> {
        let s3_config = aws_sdk_s3::config::Builder::from(aws_config)
            .force_path_style(force_path_style)
            .build();
        let store = Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: settings.frames_bucket.clone(),
            provider: settings.provider.clone(),
        };
        store
            .ensure_bucket()
            .await
            .context("while priming storage bucket")?;
        store
            .ensure_retention_policy(settings.retention_hours)
            .await
            .context("while priming retention policy")?;
        Ok(store)
    }

    async fn ensure_bucket(&self) -> eyre::Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                tracing::info!("created storage bucket '{}'", self.bucket);
                Ok(())
            }
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_bucket_already_owned_by_you()
                    || service_error.is_bucket_already_exists()
                {
                    Ok(())
                } else {
                    Err(eyre::eyre!(
                        "cannot create bucket '{}': {service_error:?}",
                        self.bucket
                    ))
                }
            }
        }
    }

    /// Applies (or refreshes) the lifecycle rule expiring `frames/` objects.
    ///
    /// `retention_hours == 0` disables retention. An existing matching rule
    /// is left untouched; unknown rules on the bucket are preserved.
    async fn ensure_retention_policy(&self, retention_hours: u32) -> eyre::Result<()> {
        if retention_hours == 0 {
            tracing::debug!("retention disabled for bucket '{}'", self.bucket);
            return Ok(());
        }
        let retention_days = retention_hours.div_ceil(24).max(1) as i32;

        let mut rules = match self
            .client
            .get_bucket_lifecycle_configuration()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(output) => output.rules().to_vec(),
            // a bucket without lifecycle configuration answers with an error
            Err(_) => Vec::new(),
        };
        if let Some(existing) = rules.iter().find(|rule| rule.id() == Some(LIFECYCLE_RULE_ID)) {
            let days = existing.expiration().and_then(|e| e.days());
            let prefix = existing.filter().and_then(|f| f.prefix());
            if days == Some(retention_days) && prefix == Some(FRAMES_PREFIX) {
                return Ok(());
            }
        }
        rules.retain(|rule| rule.id() != Some(LIFECYCLE_RULE_ID));
        rules.push(
            LifecycleRule::builder()
                .id(LIFECYCLE_RULE_ID)
                .status(ExpirationStatus::Enabled)
                .filter(LifecycleRuleFilter::builder().prefix(FRAMES_PREFIX).build())
                .expiration(LifecycleExpiration::builder().days(retention_days).build())
                .build()
                .context("while building lifecycle rule")?,
        );
        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(&self.bucket)
            .lifecycle_configuration(
                BucketLifecycleConfiguration::builder()
                    .set_rules(Some(rules))
                    .build()
                    .context("while building lifecycle configuration")?,
            )
            .send()
            .await
            .map_err(|err| eyre::eyre!("cannot set lifecycle policy: {err:?}"))?;
        tracing::info!(
            "configured lifecycle for bucket '{}': expire '{FRAMES_PREFIX}' after {retention_days} day(s)",
            self.bucket
        );
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| StorageError::Backend(format!("put '{key}': {err:?}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let service_error = err.into_service_error();
                if service_error.is_no_such_key() {
                    StorageError::NotFound(key.to_owned())
                } else {
                    StorageError::Backend(format!("get '{key}': {service_error:?}"))
                }
            })?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Backend(format!("read '{key}': {err:?}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation_token = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await
                .map_err(|err| StorageError::Backend(format!("list '{prefix}': {err:?}")))?;
            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_owned(),
                    last_modified: object
                        .last_modified()
                        .and_then(|dt| std::time::SystemTime::try_from(*dt).ok()),
                });
            }
            continuation_token = output.next_continuation_token().map(str::to_owned);
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StorageError::Backend(format!("delete '{key}': {err:?}")))?;
        Ok(())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

/// AWS config for the local MinIO emulator. Dev only.
pub async fn dev_sdk_config(environment: Environment, endpoint: &str) -> aws_config::SdkConfig {
    environment.assert_is_dev();
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .endpoint_url(endpoint)
        .region("us-east-1")
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            "minioadmin",
            "minioadmin",
            None,
            None,
            "dev-minio",
        ))
        .load()
        .await
}
