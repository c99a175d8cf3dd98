//! The artifact store and the distribution front that serves it.

use crate::ConfigResult;
use crate::stack::SiteConfig;
use sitepipe_core::LogicalId;
use sitepipe_core::distribution::{
    Behavior, BucketOrigin, DistributionSpec, ErrorResponse, OriginAccessIdentity,
};
use sitepipe_core::store::{BucketSpec, WebsiteConfiguration};

pub const BUCKET_ID: &str = "bucketReactAoD";
pub const ACCESS_IDENTITY_ID: &str = "OAI";
pub const DISTRIBUTION_ID: &str = "CloudFront";

/// Hosting resources of one stack.
#[derive(Debug, Clone)]
pub struct Hosting {
    pub bucket: BucketSpec,
    pub origin_access_identity: OriginAccessIdentity,
    pub distribution: DistributionSpec,
}

/// Declare a private website bucket readable only through one access
/// identity, and a distribution that rewrites upstream 404s to the
/// index document.
pub fn assemble_hosting(stack: &str, site: &SiteConfig) -> ConfigResult<Hosting> {
    let mut bucket = BucketSpec::new(BUCKET_ID)
        .with_website(WebsiteConfiguration {
            index_document: site.index_document.clone(),
            error_document: site.error_document.clone(),
        })
        .with_removal_policy(site.removal_policy);

    let oai = OriginAccessIdentity::new(
        stack,
        ACCESS_IDENTITY_ID,
        format!("Access identity for {}", DISTRIBUTION_ID),
    );
    bucket.grant_read(oai.principal())?;

    let distribution = DistributionSpec {
        logical_id: LogicalId::new(DISTRIBUTION_ID),
        origin: BucketOrigin {
            bucket: bucket.logical_id.clone(),
            origin_access_identity: oai.logical_id.clone(),
        },
        behaviors: vec![Behavior::default_behavior()],
        error_responses: vec![ErrorResponse::spa_fallback(&site.index_document)],
        default_root_object: Some(site.index_document.clone()),
    };
    distribution.validate()?;

    Ok(Hosting {
        bucket,
        origin_access_identity: oai,
        distribution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitepipe_core::policy::Principal;
    use sitepipe_core::store::RemovalPolicy;

    #[test]
    fn test_only_the_access_identity_can_read() {
        let hosting = assemble_hosting("CICDProdStack", &SiteConfig::default()).unwrap();

        assert_eq!(hosting.bucket.read_grants(), &[hosting.origin_access_identity.principal()]);
        assert!(!hosting.bucket.allows_read(&Principal::Anonymous));
        let other = assemble_hosting("CICDDevStack", &SiteConfig::default()).unwrap();
        assert!(!hosting.bucket.allows_read(&other.origin_access_identity.principal()));
        assert!(hosting.bucket.block_public_access);
        assert_eq!(hosting.bucket.removal_policy, RemovalPolicy::Destroy);
    }

    #[test]
    fn test_distribution_rewrites_404() {
        let hosting = assemble_hosting("CICDProdStack", &SiteConfig::default()).unwrap();
        let dist = &hosting.distribution;

        assert_eq!(dist.behaviors.iter().filter(|b| b.is_default).count(), 1);
        assert_eq!(dist.error_responses.len(), 1);
        let rule = dist.error_response_for(404).unwrap();
        assert_eq!(rule.response_code, 200);
        assert_eq!(rule.response_page_path, "/index.html");
        assert_eq!(dist.origin.bucket, hosting.bucket.logical_id);
    }
}
