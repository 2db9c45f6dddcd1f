//! Pagination domain logic centralization.
//!
//! 사이트는 최신 제품이 1페이지에 오는 newest-first 목록이다. 새 제품이 게시될
//! 때마다 기존 제품들은 뒤쪽 페이지로 밀려나므로 사이트 페이지 번호는 제품의
//! 주소로 쓸 수 없다. 로컬 주소는 게시 순서(가장 오래된 제품 = 0)에서 유도한다.
//!
//! 규칙 (`P` = page size, `N` = 현재 사이트 총 페이지 수, `L` = 마지막 페이지 제품 수):
//! - 총 제품 수 `T = (N - 1) * P + L`
//! - offset = `P - L` (마지막 물리 페이지의 부족분)
//! - 사이트 페이지 `s`의 `i`번째 제품(0 = 페이지 내 최신):
//!   `from_oldest = (N - s) * P + (P - 1 - i) - offset`
//! - `page_id = from_oldest / P`, `index_in_page = from_oldest % P`
//!
//! 예) N=482, L=4: 482페이지의 4개 제품은 page_id=0, index 3,2,1,0.
//! 481페이지의 앞 4개는 page_id=1 (index 3..0), 뒤 8개는 page_id=0 (index 11..4).
//!
//! 새 제품 k개가 게시되면 `T`와 제품의 newest-first 위치가 함께 k만큼 늘어나므로
//! `from_oldest`는 변하지 않는다. 모든 변환은 호출 시점의 `N`, `L`로 다시 계산한다.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use super::errors::PaginationError;
use super::site_metadata::SiteMetadata;

/// CSA-IoT 목록 페이지당 제품 수
pub const DEFAULT_PRODUCTS_PER_PAGE: u32 = 12;

/// Stable local address of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PagePosition {
    pub page_id: u32,
    pub index_in_page: u32,
}

impl PagePosition {
    pub const fn new(page_id: u32, index_in_page: u32) -> Self {
        Self {
            page_id,
            index_in_page,
        }
    }
}

/// Volatile address on the site: 1-based page number and 0-based index (0 = newest on page)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SitePosition {
    pub page_number: u32,
    pub index: u32,
}

/// Inclusive crawl scope.
///
/// `start_page >= end_page` in site numbering: iteration walks from the oldest
/// unverified site page toward page 1, which is ascending in local page ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlRange {
    pub start_page: u32,
    pub end_page: u32,
    pub start_page_id: u32,
    pub end_page_id: u32,
}

impl CrawlRange {
    pub const fn page_count(&self) -> u32 {
        self.start_page - self.end_page + 1
    }

    /// Site page numbers in crawl order (descending)
    pub fn site_pages(&self) -> impl Iterator<Item = u32> + use<> {
        (self.end_page..=self.start_page).rev()
    }

    /// Local page ids in crawl order (ascending)
    pub const fn local_page_ids(&self) -> RangeInclusive<u32> {
        self.start_page_id..=self.end_page_id
    }
}

/// Translates between site pagination and stable local addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIndexMapper {
    page_size: u32,
}

impl Default for PageIndexMapper {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PRODUCTS_PER_PAGE,
        }
    }
}

impl PageIndexMapper {
    pub fn new(page_size: u32) -> Result<Self, PaginationError> {
        if page_size == 0 {
            return Err(PaginationError::InvalidPageSize);
        }
        Ok(Self { page_size })
    }

    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Shortfall of the site's oldest (possibly partial) page.
    pub fn calculate_offset(&self, last_page_product_count: u32) -> Result<u32, PaginationError> {
        if last_page_product_count == 0 || last_page_product_count > self.page_size {
            return Err(PaginationError::InvalidLastPageCount {
                count: last_page_product_count,
                page_size: self.page_size,
            });
        }
        Ok(self.page_size - last_page_product_count)
    }

    /// 현재 사이트 형태 기준 총 제품 수
    pub fn total_products(
        &self,
        total_site_pages: u32,
        last_page_product_count: u32,
    ) -> Result<u64, PaginationError> {
        if total_site_pages == 0 {
            return Err(PaginationError::EmptyCatalog);
        }
        self.calculate_offset(last_page_product_count)?;
        Ok(u64::from(total_site_pages - 1) * u64::from(self.page_size)
            + u64::from(last_page_product_count))
    }

    /// Site page currently holding the oldest slots of `local_page_id`, index 0
    /// onward. With a partial last site page the rest of the local page sits on
    /// the next lower page number ([`Self::site_pages_for_slots`] covers both).
    ///
    /// Never cache the result: the same local page moves to a higher site page
    /// number every time products are published.
    pub fn to_site_page_number(
        &self,
        local_page_id: u32,
        site_total_pages: u32,
    ) -> Result<u32, PaginationError> {
        if site_total_pages == 0 {
            return Err(PaginationError::EmptyCatalog);
        }
        if local_page_id >= site_total_pages {
            return Err(PaginationError::LocalPageOutOfRange {
                page_id: local_page_id,
                total_pages: site_total_pages,
            });
        }
        Ok(site_total_pages - local_page_id)
    }

    /// Inverse of [`Self::to_site_page_number`]
    pub fn to_local_page_id(
        &self,
        site_page_number: u32,
        site_total_pages: u32,
    ) -> Result<u32, PaginationError> {
        if site_page_number == 0 || site_page_number > site_total_pages {
            return Err(PaginationError::SitePageOutOfRange {
                page_number: site_page_number,
                total_pages: site_total_pages,
            });
        }
        Ok(site_total_pages - site_page_number)
    }

    /// Maps a freshly fetched item to its stable address.
    pub fn map_to_local_indexing(
        &self,
        site_page_number: u32,
        site_index_in_page: u32,
        offset: u32,
        site_total_pages: u32,
    ) -> Result<PagePosition, PaginationError> {
        let p = u64::from(self.page_size);
        if offset >= self.page_size {
            return Err(PaginationError::InvalidLastPageCount {
                count: self.page_size.saturating_sub(offset),
                page_size: self.page_size,
            });
        }
        if site_total_pages == 0 {
            return Err(PaginationError::EmptyCatalog);
        }
        if site_page_number == 0 || site_page_number > site_total_pages {
            return Err(PaginationError::SitePageOutOfRange {
                page_number: site_page_number,
                total_pages: site_total_pages,
            });
        }
        let capacity = if site_page_number == site_total_pages {
            self.page_size - offset
        } else {
            self.page_size
        };
        if site_index_in_page >= capacity {
            return Err(PaginationError::SiteIndexOutOfRange {
                page_number: site_page_number,
                index: site_index_in_page,
                capacity,
            });
        }

        let pages_from_oldest = u64::from(site_total_pages - site_page_number);
        let from_oldest = pages_from_oldest * p + (p - 1 - u64::from(site_index_in_page))
            - u64::from(offset);

        Ok(PagePosition {
            page_id: (from_oldest / p) as u32,
            index_in_page: (from_oldest % p) as u32,
        })
    }

    /// [`Self::map_to_local_indexing`] driven by a metadata snapshot
    pub fn map_site_item(
        &self,
        site_page_number: u32,
        site_index_in_page: u32,
        site: &SiteMetadata,
    ) -> Result<PagePosition, PaginationError> {
        let offset = self.calculate_offset(site.last_page_product_count)?;
        self.map_to_local_indexing(
            site_page_number,
            site_index_in_page,
            offset,
            site.total_site_pages,
        )
    }

    /// Exact inverse of [`Self::map_to_local_indexing`]: where does a stored
    /// slot live on the site right now?
    pub fn locate_slot(
        &self,
        position: PagePosition,
        total_site_pages: u32,
        last_page_product_count: u32,
    ) -> Result<SitePosition, PaginationError> {
        let p = u64::from(self.page_size);
        let total = self.total_products(total_site_pages, last_page_product_count)?;
        if position.index_in_page >= self.page_size {
            return Err(PaginationError::SlotOutOfRange {
                page_id: position.page_id,
                index_in_page: position.index_in_page,
            });
        }
        let from_oldest = u64::from(position.page_id) * p + u64::from(position.index_in_page);
        if from_oldest >= total {
            return Err(PaginationError::SlotOutOfRange {
                page_id: position.page_id,
                index_in_page: position.index_in_page,
            });
        }
        let from_newest = total - 1 - from_oldest;
        Ok(SitePosition {
            page_number: (from_newest / p) as u32 + 1,
            index: (from_newest % p) as u32,
        })
    }

    /// Distinct site pages that currently hold the given slots of one local page.
    ///
    /// 로컬 페이지 하나는 offset 이 0이 아니면 사이트 페이지 두 개에 걸친다.
    pub fn site_pages_for_slots(
        &self,
        page_id: u32,
        indices: &[u32],
        site: &SiteMetadata,
    ) -> Result<BTreeSet<u32>, PaginationError> {
        indices
            .iter()
            .map(|&index| {
                self.locate_slot(
                    PagePosition::new(page_id, index),
                    site.total_site_pages,
                    site.last_page_product_count,
                )
                .map(|pos| pos.page_number)
            })
            .collect()
    }

    /// Number of items a fetch of `site_page_number` must return to be complete.
    pub fn expected_site_page_count(
        &self,
        site_page_number: u32,
        total_site_pages: u32,
        last_page_product_count: u32,
    ) -> Result<u32, PaginationError> {
        self.calculate_offset(last_page_product_count)?;
        if site_page_number == 0 || site_page_number > total_site_pages {
            return Err(PaginationError::SitePageOutOfRange {
                page_number: site_page_number,
                total_pages: total_site_pages,
            });
        }
        if site_page_number == total_site_pages {
            Ok(last_page_product_count)
        } else {
            Ok(self.page_size)
        }
    }

    /// Number of slots a local page holds under the current site shape.
    ///
    /// Every local page is full except the one at the live edge
    /// (`page_id == total - 1`), which holds exactly `last_page_product_count`
    /// slots. Ids past the edge hold nothing yet.
    pub fn expected_local_page_count(
        &self,
        page_id: u32,
        total_site_pages: u32,
        last_page_product_count: u32,
    ) -> u32 {
        if total_site_pages == 0 {
            return 0;
        }
        let edge = total_site_pages - 1;
        match page_id.cmp(&edge) {
            std::cmp::Ordering::Less => self.page_size,
            std::cmp::Ordering::Equal => last_page_product_count.min(self.page_size),
            std::cmp::Ordering::Greater => 0,
        }
    }

    /// Crawl scope starting from local page 0.
    ///
    /// `user_page_limit == 0` puts the whole catalog in scope.
    pub fn calculate_crawling_range(
        &self,
        total_site_pages: u32,
        last_page_product_count: u32,
        user_page_limit: u32,
    ) -> Result<CrawlRange, PaginationError> {
        self.calculate_crawling_range_from(
            0,
            total_site_pages,
            last_page_product_count,
            user_page_limit,
        )?
        .ok_or(PaginationError::EmptyCatalog)
    }

    /// Crawl scope starting at the first not-yet-verified local page.
    ///
    /// Returns `None` when every page up to the live edge is already verified.
    pub fn calculate_crawling_range_from(
        &self,
        first_unverified_page_id: u32,
        total_site_pages: u32,
        last_page_product_count: u32,
        user_page_limit: u32,
    ) -> Result<Option<CrawlRange>, PaginationError> {
        self.total_products(total_site_pages, last_page_product_count)?;
        if first_unverified_page_id >= total_site_pages {
            return Ok(None);
        }

        let start_page = total_site_pages - first_unverified_page_id;
        let page_count = if user_page_limit == 0 {
            start_page
        } else {
            user_page_limit.min(start_page)
        };
        let end_page = start_page - page_count + 1;

        Ok(Some(CrawlRange {
            start_page,
            end_page,
            start_page_id: total_site_pages - start_page,
            end_page_id: total_site_pages - end_page,
        }))
    }

    /// Local pages whose every slot lies on a site page inside `range`.
    ///
    /// 범위의 마지막 로컬 페이지는 offset 때문에 범위 밖 사이트 페이지에 일부가
    /// 걸칠 수 있으므로 검증 대상에서 빠진다. 범위가 1페이지까지 닿으면 live edge
    /// 페이지도 포함된다.
    pub fn fully_covered_local_pages(
        &self,
        range: &CrawlRange,
        total_site_pages: u32,
        last_page_product_count: u32,
    ) -> Result<Option<RangeInclusive<u32>>, PaginationError> {
        let p = u64::from(self.page_size);
        let total = self.total_products(total_site_pages, last_page_product_count)?;
        if range.end_page == 0 || range.start_page > total_site_pages || range.end_page > range.start_page
        {
            return Err(PaginationError::SitePageOutOfRange {
                page_number: range.start_page.max(range.end_page),
                total_pages: total_site_pages,
            });
        }

        // newest-first positions covered by the range
        let newest_lo = u64::from(range.end_page - 1) * p;
        let newest_hi = (u64::from(range.start_page) * p).min(total) - 1;
        // converted to oldest-first positions
        let oldest_lo = total - 1 - newest_hi;
        let oldest_hi = total - 1 - newest_lo;

        let first = oldest_lo.div_ceil(p);
        let last = if oldest_hi == total - 1 {
            u64::from(total_site_pages - 1)
        } else {
            match ((oldest_hi + 1) / p).checked_sub(1) {
                Some(last) => last,
                None => return Ok(None),
            }
        };

        if first > last {
            return Ok(None);
        }
        Ok(Some(first as u32..=last as u32))
    }
}
