//! Locator - Find zero or one existing resource for a filter

use log::debug;

use crate::error::CoreError;
use crate::provider::{CloudProvider, ProviderErrorKind};
use crate::resource::{FoundResource, ResourceFilter};
use crate::waiter::{RetryPolicy, Waiter};

pub struct Locator<'a> {
    provider: &'a dyn CloudProvider,
    waiter: &'a Waiter,
}

impl<'a> Locator<'a> {
    pub fn new(provider: &'a dyn CloudProvider, waiter: &'a Waiter) -> Self {
        Self { provider, waiter }
    }

    /// Look up the single resource matching `filter`
    ///
    /// "No match" is `Ok(None)`. More than one match is a tagging or
    /// configuration error and fails with [`CoreError::AmbiguousMatch`].
    pub async fn locate(&self, filter: &ResourceFilter) -> Result<Option<FoundResource>, CoreError> {
        let mut found = self
            .waiter
            .retry_throttled(&RetryPolicy::throttle(), || {
                self.provider.find_resources(filter)
            })
            .await
            .map_err(|cause| match cause.kind {
                ProviderErrorKind::Conflict => CoreError::NameConflict {
                    kind: filter.kind,
                    name: filter.name().unwrap_or_default().to_string(),
                    cause,
                },
                _ => CoreError::LookupFailed {
                    kind: filter.kind,
                    cause,
                },
            })?;

        // Providers may filter coarsely; apply the exact criteria again
        found.retain(|r| filter.matches(r));

        match found.len() {
            0 => {
                debug!("No {} found", filter);
                Ok(None)
            }
            1 => {
                let resource = found.remove(0);
                debug!("Found {}: {}", filter, resource.id);
                Ok(Some(resource))
            }
            _ => Err(CoreError::AmbiguousMatch {
                filter: filter.to_string(),
                candidates: found.into_iter().map(|r| r.id).collect(),
            }),
        }
    }

    /// Identifier of the single match, if any
    pub async fn locate_id(&self, filter: &ResourceFilter) -> Result<Option<String>, CoreError> {
        Ok(self.locate(filter).await?.map(|r| r.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{NAME_TAG, ResourceKind, attr};
    use crate::testing::{FakeProvider, RecordingSleeper};
    use std::sync::Arc;

    fn waiter() -> Waiter {
        Waiter::new(Arc::new(RecordingSleeper::default()))
    }

    #[tokio::test]
    async fn no_match_is_none() {
        let provider = FakeProvider::new();
        let waiter = waiter();
        let locator = Locator::new(&provider, &waiter);
        let filter = ResourceFilter::new(ResourceKind::Vpc).with_tag(NAME_TAG, "pf1-vpc");
        assert_eq!(locator.locate(&filter).await.unwrap(), None);
    }

    #[tokio::test]
    async fn single_match_is_returned() {
        let provider = FakeProvider::new();
        provider.insert(
            ResourceKind::KeyPair,
            FoundResource::new("pf1-ec2-key").with_attribute(attr::NAME, "pf1-ec2-key"),
        );
        let waiter = waiter();
        let locator = Locator::new(&provider, &waiter);
        let filter = ResourceFilter::new(ResourceKind::KeyPair).with_name("pf1-ec2-key");
        assert_eq!(
            locator.locate_id(&filter).await.unwrap(),
            Some("pf1-ec2-key".to_string())
        );
    }

    #[tokio::test]
    async fn two_matches_are_ambiguous() {
        let provider = FakeProvider::new();
        for id in ["vpc-1", "vpc-2"] {
            provider.insert(
                ResourceKind::Vpc,
                FoundResource::new(id).with_tag(NAME_TAG, "pf1-vpc"),
            );
        }
        let waiter = waiter();
        let locator = Locator::new(&provider, &waiter);
        let filter = ResourceFilter::new(ResourceKind::Vpc).with_tag(NAME_TAG, "pf1-vpc");

        match locator.locate(&filter).await {
            Err(CoreError::AmbiguousMatch { candidates, .. }) => {
                assert_eq!(candidates, vec!["vpc-1", "vpc-2"]);
            }
            other => panic!("Expected AmbiguousMatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn lookup_is_read_only() {
        let provider = FakeProvider::new();
        let waiter = waiter();
        let locator = Locator::new(&provider, &waiter);
        let filter = ResourceFilter::new(ResourceKind::Bucket).with_name("demo");
        locator.locate(&filter).await.unwrap();
        assert_eq!(provider.calls(), vec!["find:s3.bucket"]);
        assert_eq!(provider.total_creates(), 0);
    }

    #[tokio::test]
    async fn foreign_bucket_is_name_conflict() {
        let provider = FakeProvider::new();
        provider.fail_find(ResourceKind::Bucket, ProviderErrorKind::Conflict);
        let waiter = waiter();
        let locator = Locator::new(&provider, &waiter);
        let filter = ResourceFilter::new(ResourceKind::Bucket).with_name("taken-bucket");

        match locator.locate(&filter).await {
            Err(CoreError::NameConflict { kind, name, .. }) => {
                assert_eq!(kind, ResourceKind::Bucket);
                assert_eq!(name, "taken-bucket");
            }
            other => panic!("Expected NameConflict, got {:?}", other),
        }
        assert_eq!(provider.calls_matching("find:").len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_is_lookup_failed() {
        let provider = FakeProvider::new();
        provider.fail_find(ResourceKind::SecurityGroup, ProviderErrorKind::Other);
        let waiter = waiter();
        let locator = Locator::new(&provider, &waiter);
        let filter = ResourceFilter::new(ResourceKind::SecurityGroup).with_name("pf1-public-sg");

        let err = locator.locate(&filter).await.unwrap_err();

        assert!(matches!(
            err,
            CoreError::LookupFailed {
                kind: ResourceKind::SecurityGroup,
                ..
            }
        ));
        assert_eq!(provider.calls_matching("find:").len(), 1);
    }

    #[tokio::test]
    async fn throttled_lookup_is_retried_then_fails() {
        let provider = FakeProvider::new();
        provider.fail_find(ResourceKind::Vpc, ProviderErrorKind::Throttled);
        let waiter = waiter();
        let locator = Locator::new(&provider, &waiter);
        let filter = ResourceFilter::new(ResourceKind::Vpc).with_tag(NAME_TAG, "pf1-vpc");

        let err = locator.locate(&filter).await.unwrap_err();

        assert!(matches!(err, CoreError::LookupFailed { .. }));
        assert_eq!(
            provider.calls_matching("find:vpc").len() as u32,
            RetryPolicy::throttle().max_attempts
        );
    }
}
