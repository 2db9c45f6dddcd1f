//! HTML parsing for CSA-IoT product listing pages
//!
//! 목록 페이지 하나에서 제품 행(사이트 순서, 0 = 최신)과 페이지네이션에 보이는
//! 최대 페이지 번호를 추출한다.

use anyhow::{Result, anyhow};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::domain::RawProductRecord;
use crate::infrastructure::config::{CatalogConfig, defaults};

lazy_static! {
    /// `/page/123/` 또는 `paged=123`
    static ref PAGE_NUMBER_PATTERNS: Vec<Regex> = [r"/page/(\d+)/?", r"[?&]paged?=(\d+)"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();
}

/// Upper bound for a page number read from pagination text
const MAX_REASONABLE_PAGE: u32 = 100_000;

#[derive(Debug, Clone)]
pub struct ListPageSelectors {
    pub product_container: Vec<String>,
    pub product_link: Vec<String>,
    pub manufacturer: Vec<String>,
    pub model: Vec<String>,
    pub certificate_id: Vec<String>,
    pub pagination: Vec<String>,
}

impl Default for ListPageSelectors {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
        Self {
            product_container: owned(defaults::PRODUCT_SELECTORS),
            product_link: owned(&["a[href*='csa_product']", "h2 a", "a"]),
            manufacturer: owned(&[".entry-company", ".manufacturer", ".company-name"]),
            model: owned(&[".entry-title", ".product-title", "h2"]),
            certificate_id: owned(&[".entry-certificate-id", ".certificate-id", ".cert-id"]),
            pagination: owned(&[".page-numbers", ".pagination a"]),
        }
    }
}

/// Selector lists compiled once; entries that fail to parse are dropped
struct CompiledSelectors {
    product_container: Vec<Selector>,
    product_link: Vec<Selector>,
    manufacturer: Vec<Selector>,
    model: Vec<Selector>,
    certificate_id: Vec<Selector>,
    pagination: Vec<Selector>,
}

fn compile(selectors: &[String]) -> Vec<Selector> {
    selectors
        .iter()
        .filter_map(|s| match Selector::parse(s) {
            Ok(selector) => Some(selector),
            Err(e) => {
                debug!("Skipping invalid selector '{}': {:?}", s, e);
                None
            }
        })
        .collect()
}

/// Extraction result of one listing page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPageContent {
    pub records: Vec<RawProductRecord>,
    pub max_page_in_pagination: Option<u32>,
}

pub struct ListPageExtractor {
    selectors: CompiledSelectors,
    catalog: CatalogConfig,
}

impl ListPageExtractor {
    pub fn new(selectors: &ListPageSelectors, catalog: CatalogConfig) -> Result<Self> {
        let compiled = CompiledSelectors {
            product_container: compile(&selectors.product_container),
            product_link: compile(&selectors.product_link),
            manufacturer: compile(&selectors.manufacturer),
            model: compile(&selectors.model),
            certificate_id: compile(&selectors.certificate_id),
            pagination: compile(&selectors.pagination),
        };
        if compiled.product_container.is_empty() {
            return Err(anyhow!("No valid product container selector"));
        }
        Ok(Self {
            selectors: compiled,
            catalog,
        })
    }

    pub fn with_defaults(catalog: CatalogConfig) -> Result<Self> {
        Self::new(&ListPageSelectors::default(), catalog)
    }

    pub fn extract(&self, html: &str) -> ListPageContent {
        let doc = Html::parse_document(html);
        ListPageContent {
            records: self.extract_records(&doc),
            max_page_in_pagination: self.find_max_page_in_pagination(&doc),
        }
    }

    /// 첫 번째로 결과가 나오는 컨테이너 selector 를 사용한다
    fn extract_records(&self, doc: &Html) -> Vec<RawProductRecord> {
        let containers = self
            .selectors
            .product_container
            .iter()
            .map(|selector| doc.select(selector).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
            .unwrap_or_default();

        // site_index 는 DOM 위치 기준. 링크 없는 카드도 자리는 차지한다.
        containers
            .into_iter()
            .enumerate()
            .filter_map(|(site_index, container)| {
                let Some(url) = self.extract_url(&container) else {
                    debug!("Card {} has no product link, skipping", site_index);
                    return None;
                };
                Some(RawProductRecord {
                    url,
                    manufacturer: first_text(&container, &self.selectors.manufacturer),
                    model: first_text(&container, &self.selectors.model),
                    certificate_id: first_text(&container, &self.selectors.certificate_id),
                    site_index: site_index as u32,
                })
            })
            .collect()
    }

    fn extract_url(&self, container: &ElementRef<'_>) -> Option<String> {
        self.selectors
            .product_link
            .iter()
            .find_map(|selector| {
                container
                    .select(selector)
                    .find_map(|link| link.value().attr("href"))
            })
            .map(|href| self.catalog.resolve_url(href.trim()))
    }

    /// 페이지네이션에서 최대 페이지 번호 찾기 (href 와 텍스트 모두 확인)
    fn find_max_page_in_pagination(&self, doc: &Html) -> Option<u32> {
        let mut max_page = None;
        for selector in &self.selectors.pagination {
            for element in doc.select(selector) {
                let from_href = element.value().attr("href").and_then(extract_page_number);
                let text = element.text().collect::<String>();
                let from_text = text
                    .trim()
                    .replace(',', "")
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n < MAX_REASONABLE_PAGE);

                for candidate in [from_href, from_text].into_iter().flatten() {
                    max_page = Some(max_page.map_or(candidate, |m: u32| m.max(candidate)));
                }
            }
        }
        debug!("Max page found in pagination: {:?}", max_page);
        max_page
    }
}

fn first_text(element: &ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        element
            .select(selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|text| !text.is_empty())
    })
}

/// URL에서 페이지 번호 추출
pub fn extract_page_number(url: &str) -> Option<u32> {
    PAGE_NUMBER_PATTERNS.iter().find_map(|re| {
        re.captures(url)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}
