//! End-to-end crawl → verify → backfill against SQLite

mod common;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::{GrowingCatalog, crawler};
use matter_certis_crawler::application::{ConsistencyChecker, CrawlCoordinator};
use matter_certis_crawler::domain::{PageIndexMapper, ProductStore};
use matter_certis_crawler::infrastructure::{DatabaseConnection, SqliteProductRepository};

async fn sqlite_store() -> Arc<SqliteProductRepository> {
    let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    Arc::new(SqliteProductRepository::new(db.pool().clone()))
}

#[tokio::test]
async fn full_crawl_then_publication_keeps_addresses() {
    let catalog = GrowingCatalog::new(150);
    let store = sqlite_store().await;
    let coordinator = CrawlCoordinator::new(Arc::new(crawler(&catalog, store.clone())));
    let cancel = CancellationToken::new();

    let first = coordinator.run_incremental(0, &cancel).await.unwrap();
    assert!(first.crawl.is_complete());
    assert!(first.gaps.is_empty());
    assert_eq!(store.count().await.unwrap(), 150);

    let before = store.list_addresses().await.unwrap();

    // 새 제품이 올라오면 기존 제품의 사이트 페이지 번호가 밀린다
    catalog.publish(7);
    let second = coordinator.run_incremental(0, &cancel).await.unwrap();
    // only the live edge page and the new slots are re-crawled
    assert_eq!(second.crawl.range.unwrap().start_page_id, 12);
    assert_eq!(store.count().await.unwrap(), 157);

    let after = store.list_addresses().await.unwrap();
    for address in &before {
        assert!(after.contains(address), "{} moved", address.url);
    }

    let site = coordinator.crawler().site_cache().resolve(false).await.unwrap();
    let report = ConsistencyChecker::new(PageIndexMapper::default(), store)
        .check(&site)
        .await
        .unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.valid, 157);
}

#[tokio::test]
async fn backfill_restores_deleted_rows() {
    let catalog = GrowingCatalog::new(60);
    let store = sqlite_store().await;
    let coordinator = CrawlCoordinator::new(Arc::new(crawler(&catalog, store.clone())));
    let cancel = CancellationToken::new();
    coordinator.run_incremental(0, &cancel).await.unwrap();

    let addresses = store.list_addresses().await.unwrap();
    assert_eq!(addresses.len(), 60);
    for victim in addresses.iter().filter(|a| a.page_id == 2).take(3) {
        assert!(store.delete_by_url(&victim.url).await.unwrap());
    }
    assert_eq!(store.count().await.unwrap(), 57);

    let requests_before = catalog.requests();
    let report = coordinator.verify_and_backfill(0..5, &cancel).await.unwrap();
    assert_eq!(report.gaps.len(), 1);
    assert_eq!(report.gaps[0].page_id, 2);
    assert_eq!(report.backfill.unwrap().collected, 3);
    assert_eq!(store.count().await.unwrap(), 60);
    // last page is full, so local page 2 is exactly one site page
    assert_eq!(catalog.requests() - requests_before, 1);
}
