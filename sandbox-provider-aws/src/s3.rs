//! S3 bucket lookup, creation and removal

use std::collections::BTreeMap;

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration, Tag, Tagging};
use log::debug;
use sandbox_core::provider::{CreatedResource, ProviderError, ProviderErrorKind, ProviderResult};
use sandbox_core::resource::{BucketSpec, FoundResource, NAME_TAG, ResourceFilter, Tags, attr};

use crate::AwsProvider;
use crate::errors::sdk_error;
use crate::rollback::undo_on_error;

/// Region that rejects an explicit LocationConstraint
const DEFAULT_S3_REGION: &str = "us-east-1";

/// How a failed HeadBucket call is read
#[derive(Debug, PartialEq, Eq)]
enum HeadOutcome {
    Missing,
    /// Owned by another account (403) or living in another region (301)
    Foreign,
    Failed,
}

impl HeadOutcome {
    fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(404) => HeadOutcome::Missing,
            Some(301) | Some(403) => HeadOutcome::Foreign,
            _ => HeadOutcome::Failed,
        }
    }
}

fn location_constraint(region: &str) -> Option<CreateBucketConfiguration> {
    (region != DEFAULT_S3_REGION).then(|| {
        CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::from(region))
            .build()
    })
}

fn bucket_tagging(tags: &Tags) -> ProviderResult<Tagging> {
    let tag_set = tags
        .iter()
        .map(|(key, value)| {
            Tag::builder()
                .key(key)
                .value(value)
                .build()
                .map_err(|e| ProviderError::new(format!("Failed to build S3 tag: {}", e)))
        })
        .collect::<ProviderResult<Vec<_>>>()?;
    Tagging::builder()
        .set_tag_set(Some(tag_set))
        .build()
        .map_err(|e| ProviderError::new(format!("Failed to build S3 tagging: {}", e)))
}

impl AwsProvider {
    /// Explicit names are checked directly; generated buckets are found by tag
    pub(crate) async fn find_buckets(&self, filter: &ResourceFilter) -> ProviderResult<Vec<FoundResource>> {
        if let Some(name) = filter.name() {
            return Ok(self.head_bucket(name).await?.into_iter().collect());
        }

        let Some(logical_name) = filter.tag(NAME_TAG) else {
            return Err(ProviderError::new(
                "Bucket lookups need a name or a Name tag criterion",
            ));
        };

        let listed = self
            .s3_client
            .list_buckets()
            .send()
            .await
            .map_err(|e| sdk_error("Failed to list buckets", e))?;

        let mut found = Vec::new();
        for bucket in listed.buckets() {
            let Some(name) = bucket.name() else { continue };
            let tags = match self.bucket_tags(name).await {
                Ok(tags) => tags,
                Err(e) => {
                    // Buckets in other regions or without tags are not ours
                    debug!("Skipping bucket {}: {}", name, e);
                    continue;
                }
            };
            if tags.get(NAME_TAG).map(String::as_str) == Some(logical_name) {
                let mut resource = FoundResource::new(name).with_attribute(attr::NAME, name);
                resource.tags = tags;
                found.push(resource);
            }
        }
        Ok(found)
    }

    /// A bucket we can reach, `None` if it does not exist, `Conflict` if someone else owns it
    async fn head_bucket(&self, name: &str) -> ProviderResult<Option<FoundResource>> {
        match self.s3_client.head_bucket().bucket(name).send().await {
            Ok(_) => {
                let mut resource = FoundResource::new(name).with_attribute(attr::NAME, name);
                if let Ok(tags) = self.bucket_tags(name).await {
                    resource.tags = tags;
                }
                Ok(Some(resource))
            }
            Err(err) => {
                let status = match &err {
                    SdkError::ServiceError(service_err) => {
                        Some(service_err.raw().status().as_u16())
                    }
                    _ => None,
                };
                match HeadOutcome::from_status(status) {
                    HeadOutcome::Missing => Ok(None),
                    HeadOutcome::Foreign => Err(ProviderError::new(format!(
                        "Bucket {} exists but is not accessible from this account and region",
                        name
                    ))
                    .with_kind(ProviderErrorKind::Conflict)),
                    HeadOutcome::Failed => Err(sdk_error("Failed to read bucket", err)),
                }
            }
        }
    }

    async fn bucket_tags(&self, name: &str) -> ProviderResult<BTreeMap<String, String>> {
        let result = self
            .s3_client
            .get_bucket_tagging()
            .bucket(name)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to read bucket tags", e))?;
        Ok(result
            .tag_set()
            .iter()
            .map(|t| (t.key().to_string(), t.value().to_string()))
            .collect())
    }

    pub(crate) async fn create_bucket(&self, spec: &BucketSpec) -> ProviderResult<CreatedResource> {
        let tagging = bucket_tagging(&spec.tags)?;

        let created_here = match self
            .s3_client
            .create_bucket()
            .bucket(&spec.bucket_name)
            .set_create_bucket_configuration(location_constraint(&spec.region))
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                let err = sdk_error("Failed to create bucket", e);
                if err.code.as_deref() != Some("BucketAlreadyOwnedByYou") {
                    return Err(err);
                }
                debug!("Bucket {} already owned by this account", spec.bucket_name);
                false
            }
        };

        let tagged = self
            .s3_client
            .put_bucket_tagging()
            .bucket(&spec.bucket_name)
            .tagging(tagging)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| sdk_error("Failed to tag bucket", e));

        // An untagged generated bucket could never be found again
        if created_here {
            let name = spec.bucket_name.as_str();
            let what = format!("bucket {}", name);
            undo_on_error(&what, tagged, || self.delete_bucket(name)).await?;
        } else {
            tagged?;
        }

        Ok(CreatedResource::new(&spec.bucket_name))
    }

    /// Empty the bucket, then delete it
    pub(crate) async fn delete_bucket(&self, name: &str) -> ProviderResult<()> {
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .s3_client
                .list_objects_v2()
                .bucket(name)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| sdk_error("Failed to list bucket objects", e))?;

            for object in page.contents() {
                if let Some(key) = object.key() {
                    self.s3_client
                        .delete_object()
                        .bucket(name)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| sdk_error("Failed to delete object", e))?;
                }
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        self.s3_client
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(|e| sdk_error("Failed to delete bucket", e))?;
        Ok(())
    }
}
