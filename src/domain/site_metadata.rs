use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::errors::PaginationError;

/// Current shape of the remote catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteMetadata {
    pub total_site_pages: u32,
    /// Items on the oldest (highest numbered) site page, `1..=page_size`
    pub last_page_product_count: u32,
    pub fetched_at: DateTime<Utc>,
}

impl SiteMetadata {
    pub fn new(total_site_pages: u32, last_page_product_count: u32) -> Self {
        Self {
            total_site_pages,
            last_page_product_count,
            fetched_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self, ttl: std::time::Duration) -> bool {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(36_500));
        Utc::now().signed_duration_since(self.fetched_at) < ttl
    }

    pub fn validate(&self, page_size: u32) -> Result<(), PaginationError> {
        if self.total_site_pages == 0 {
            return Err(PaginationError::EmptyCatalog);
        }
        if self.last_page_product_count == 0 || self.last_page_product_count > page_size {
            return Err(PaginationError::InvalidLastPageCount {
                count: self.last_page_product_count,
                page_size,
            });
        }
        Ok(())
    }

    pub fn total_products(&self, page_size: u32) -> u64 {
        u64::from(self.total_site_pages.saturating_sub(1)) * u64::from(page_size)
            + u64::from(self.last_page_product_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_follows_ttl() {
        let mut meta = SiteMetadata::new(10, 5);
        assert!(meta.is_fresh(std::time::Duration::from_secs(60)));
        meta.fetched_at = Utc::now() - Duration::seconds(120);
        assert!(!meta.is_fresh(std::time::Duration::from_secs(60)));
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        assert!(SiteMetadata::new(10, 5).validate(12).is_ok());
        assert!(SiteMetadata::new(0, 5).validate(12).is_err());
        assert!(SiteMetadata::new(10, 13).validate(12).is_err());
        assert_eq!(SiteMetadata::new(10, 5).total_products(12), 113);
    }
}
