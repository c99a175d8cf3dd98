//! Bucket access with grant enforcement.

use async_trait::async_trait;
use bytes::Bytes;
use sitepipe_core::artifact::ArtifactBundle;
use sitepipe_core::policy::Principal;
use sitepipe_core::store::{ContentStore, GET_OBJECT};
use sitepipe_core::{Error, Result};
use tracing::debug;

use crate::cloud::{Bucket, LocalCloud};

/// [`ContentStore`] over the buckets of a [`LocalCloud`].
///
/// Reads are checked against the bucket's read grants. Writes model the
/// pipeline's own deploy path and are not grant-checked.
#[derive(Clone)]
pub struct LocalContentStore {
    cloud: LocalCloud,
}

impl LocalContentStore {
    pub fn new(cloud: LocalCloud) -> Self {
        Self { cloud }
    }
}

fn writable<'a>(bucket: Option<&'a mut Bucket>, name: &str) -> Result<&'a mut Bucket> {
    let bucket = bucket.ok_or_else(|| {
        Error::DeploymentFailed(format!("bucket '{}' does not exist", name))
    })?;
    if !bucket.accepts_writes {
        return Err(Error::DeploymentFailed(format!(
            "bucket '{}' is unreachable",
            name
        )));
    }
    Ok(bucket)
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn get_object(&self, bucket: &str, key: &str, principal: &Principal) -> Result<Bytes> {
        let state = self.cloud.state().read().await;
        let found = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Error::NotFound(format!("bucket '{}'", bucket)))?;

        if !found.spec.permits(principal, GET_OBJECT, key) {
            debug!(bucket, key, principal = %principal, "Read denied");
            return Err(Error::Forbidden(format!(
                "{} may not read bucket '{}'",
                principal, bucket
            )));
        }

        found
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object '{}' in bucket '{}'", key, bucket)))
    }

    async fn put_object(&self, bucket: &str, key: &str, content: Bytes) -> Result<()> {
        let mut state = self.cloud.state().write().await;
        let target = writable(state.buckets.get_mut(bucket), bucket)?;
        target.objects.insert(key.to_string(), content);
        Ok(())
    }

    async fn replace_contents(&self, bucket: &str, bundle: ArtifactBundle) -> Result<()> {
        let files = bundle.into_files();
        let mut state = self.cloud.state().write().await;
        let target = writable(state.buckets.get_mut(bucket), bucket)?;
        target.objects = files;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>> {
        let state = self.cloud.state().read().await;
        let found = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Error::NotFound(format!("bucket '{}'", bucket)))?;
        Ok(found.objects.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitepipe_core::LogicalId;
    use sitepipe_core::store::BucketSpec;
    use std::collections::BTreeMap;

    fn oai() -> Principal {
        Principal::AccessIdentity {
            stack: "Stack".to_string(),
            logical_id: LogicalId::new("OAI"),
        }
    }

    async fn store_with_bucket() -> (LocalCloud, LocalContentStore) {
        let cloud = LocalCloud::new();
        let mut spec = BucketSpec::new("bucketReactAoD");
        spec.grant_read(oai()).unwrap();
        cloud.state().write().await.buckets.insert(
            "site".to_string(),
            Bucket {
                spec,
                owner: Some("Stack".to_string()),
                objects: BTreeMap::new(),
                accepts_writes: true,
            },
        );
        let store = cloud.content_store();
        (cloud, store)
    }

    #[tokio::test]
    async fn test_reads_require_grant() {
        let (_cloud, store) = store_with_bucket().await;
        store
            .put_object("site", "index.html", Bytes::from_static(b"<html/>"))
            .await
            .unwrap();

        let body = store.get_object("site", "index.html", &oai()).await.unwrap();
        assert_eq!(body.as_ref(), b"<html/>");

        let denied = store
            .get_object("site", "index.html", &Principal::Anonymous)
            .await;
        assert!(matches!(denied, Err(Error::Forbidden(_))));

        let missing = store.get_object("site", "nope.html", &oai()).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_replace_contents_drops_stale_objects() {
        let (_cloud, store) = store_with_bucket().await;
        store
            .put_object("site", "old.js", Bytes::from_static(b"old"))
            .await
            .unwrap();

        let bundle = ArtifactBundle::new()
            .with_file("index.html", "v2")
            .with_file("static/app.js", "app");
        store.replace_contents("site", bundle).await.unwrap();

        assert_eq!(
            store.list_objects("site").await.unwrap(),
            vec!["index.html", "static/app.js"]
        );
    }

    #[tokio::test]
    async fn test_failed_write_keeps_contents() {
        let (cloud, store) = store_with_bucket().await;
        store
            .replace_contents("site", ArtifactBundle::new().with_file("index.html", "v1"))
            .await
            .unwrap();

        cloud.set_accepts_writes("site", false).await.unwrap();
        let err = store
            .replace_contents("site", ArtifactBundle::new().with_file("index.html", "v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeploymentFailed(_)));

        let body = store.get_object("site", "index.html", &oai()).await.unwrap();
        assert_eq!(body.as_ref(), b"v1");
    }

    #[tokio::test]
    async fn test_unknown_bucket() {
        let store = LocalCloud::new().content_store();
        assert!(matches!(
            store.list_objects("ghost").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.put_object("ghost", "k", Bytes::new()).await,
            Err(Error::DeploymentFailed(_))
        ));
    }
}
