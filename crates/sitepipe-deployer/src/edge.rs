//! Serving bucket content through a distribution front.

use bytes::Bytes;
use sitepipe_core::distribution::EdgeResponse;
use sitepipe_core::store::ContentStore;
use sitepipe_core::{Error, Result};
use tracing::debug;

use crate::cloud::LocalCloud;
use crate::store::LocalContentStore;

/// Answers requests for provisioned distribution domains.
///
/// The origin bucket is read as the distribution's access identity, and
/// upstream 403/404 responses go through the distribution's error-response
/// table.
#[derive(Clone)]
pub struct LocalEdge {
    cloud: LocalCloud,
    store: LocalContentStore,
}

impl LocalEdge {
    pub fn new(cloud: LocalCloud) -> Self {
        let store = cloud.content_store();
        Self { cloud, store }
    }

    pub async fn fetch(&self, domain: &str, path: &str) -> Result<EdgeResponse> {
        let distribution = self
            .cloud
            .state()
            .read()
            .await
            .distributions
            .get(domain)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("distribution '{}'", domain)))?;
        let spec = &distribution.spec;
        let bucket = &distribution.bucket_name;
        let reader = &distribution.reader;

        let key = spec.object_key(path);
        let status = match self.store.get_object(bucket, &key, reader).await {
            Ok(body) => {
                return Ok(EdgeResponse {
                    status: 200,
                    key,
                    body,
                });
            }
            Err(Error::NotFound(_)) => 404,
            Err(Error::Forbidden(_)) => 403,
            Err(e) => return Err(e),
        };

        let Some(rule) = spec.error_response_for(status) else {
            return Ok(EdgeResponse {
                status,
                key,
                body: Bytes::new(),
            });
        };

        let page = spec.object_key(&rule.response_page_path);
        debug!(
            domain,
            path,
            upstream = status,
            status = rule.response_code,
            page = %page,
            "Rewriting error response"
        );
        match self.store.get_object(bucket, &page, reader).await {
            Ok(body) => Ok(EdgeResponse {
                status: rule.response_code,
                key: page,
                body,
            }),
            Err(Error::NotFound(_)) => Ok(EdgeResponse {
                status: 404,
                key: page,
                body: Bytes::new(),
            }),
            Err(e) => Err(e),
        }
    }
}
