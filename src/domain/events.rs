//! Crawl progress and per-task events.
//!
//! 엔진은 진행 상황을 mpsc 채널로 내보낸다. 수신자가 없거나 이미 닫혀도
//! 크롤링에는 영향이 없다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use super::page_status::PageStatus;

/// 크롤링 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStage {
    /// 사이트 상태 확인 (총 페이지 수, 마지막 페이지 제품 수)
    SiteProbe,
    /// 제품 목록 수집
    ProductList,
    /// 누락 슬롯 재수집
    GapCollection,
}

impl fmt::Display for CrawlStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SiteProbe => write!(f, "사이트 상태 확인"),
            Self::ProductList => write!(f, "제품 목록 수집"),
            Self::GapCollection => write!(f, "누락 제품 재수집"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Success,
    Error,
    /// Cancelled before the fetch settled
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub stage: CrawlStage,
    pub page_id: u32,
    pub page_number: u32,
    pub url: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Per-page task lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusEvent {
    /// `page-{page_id}`
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub payload: TaskPayload,
}

/// Aggregate progress snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub session_id: Option<String>,
    pub stage: CrawlStage,
    pub processed_successfully: u32,
    pub total_pages: u32,
    pub page_statuses: Vec<PageStatus>,
    pub retry_cycle: u32,
    pub stage_started_at: DateTime<Utc>,
    pub stage_complete: bool,
}

impl CrawlProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_pages == 0 {
            return 100.0;
        }
        f64::from(self.processed_successfully) / f64::from(self.total_pages) * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CrawlEvent {
    Progress(CrawlProgress),
    Task(TaskStatusEvent),
}

pub type EventSender = mpsc::UnboundedSender<CrawlEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<CrawlEvent>;

/// Optional sink for crawl events
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    sender: Option<EventSender>,
}

impl EventEmitter {
    pub const fn new(sender: Option<EventSender>) -> Self {
        Self { sender }
    }

    pub const fn disabled() -> Self {
        Self { sender: None }
    }

    /// Creates an emitter together with its receiving end
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Some(tx)), rx)
    }

    pub const fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn emit(&self, event: CrawlEvent) {
        if let Some(sender) = &self.sender {
            // 수신측이 사라진 경우는 무시
            let _ = sender.send(event);
        }
    }

    pub fn progress(&self, progress: CrawlProgress) {
        self.emit(CrawlEvent::Progress(progress));
    }

    pub fn task(&self, status: TaskStatus, message: impl Into<String>, payload: TaskPayload) {
        if !self.is_enabled() {
            return;
        }
        self.emit(CrawlEvent::Task(TaskStatusEvent {
            task_id: format!("page-{}", payload.page_id),
            status,
            message: message.into(),
            timestamp: Utc::now(),
            payload,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> TaskPayload {
        TaskPayload {
            stage: CrawlStage::ProductList,
            page_id: 4,
            page_number: 6,
            url: "https://example.test/page/6/".into(),
            attempt: 1,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn emitter_forwards_task_events() {
        let (emitter, mut rx) = EventEmitter::channel();
        emitter.task(TaskStatus::Running, "fetching", payload());

        match rx.recv().await {
            Some(CrawlEvent::Task(event)) => {
                assert_eq!(event.task_id, "page-4");
                assert_eq!(event.status, TaskStatus::Running);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn disabled_emitter_and_closed_channel_are_silent() {
        EventEmitter::disabled().task(TaskStatus::Success, "done", payload());

        let (emitter, rx) = EventEmitter::channel();
        drop(rx);
        emitter.task(TaskStatus::Error, "boom", payload());
    }

    #[test]
    fn stage_display_is_localized() {
        assert_eq!(CrawlStage::ProductList.to_string(), "제품 목록 수집");
    }
}
