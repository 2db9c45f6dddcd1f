//! Per-page crawl bookkeeping and gap reports.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::PageErrorKind;

/// 페이지 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Waiting,
    Attempting,
    Success,
    /// Fetched fine but returned fewer records than the page holds
    Incomplete,
    Failed,
}

impl PageState {
    pub const fn needs_retry(self) -> bool {
        matches!(self, Self::Incomplete | Self::Failed)
    }

    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Success | Self::Incomplete | Self::Failed)
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Waiting => "waiting",
            Self::Attempting => "attempting",
            Self::Success => "success",
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStatus {
    pub page_id: u32,
    /// Site page number requested on the latest attempt
    pub page_number: u32,
    pub state: PageState,
    pub attempt: u32,
    /// Distinct records accumulated across attempts
    pub collected: u32,
    pub target: u32,
    pub error_kind: Option<PageErrorKind>,
    pub error: Option<String>,
}

impl PageStatus {
    pub const fn waiting(page_id: u32, page_number: u32, target: u32) -> Self {
        Self {
            page_id,
            page_number,
            state: PageState::Waiting,
            attempt: 0,
            collected: 0,
            target,
            error_kind: None,
            error: None,
        }
    }
}

/// A local page whose stored slots are fewer than expected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageGap {
    pub page_id: u32,
    pub expected_count: u32,
    pub actual_count: u32,
    /// Ascending, within `[0, expected_count)`
    pub missing_indices: Vec<u32>,
}

impl PageGap {
    pub fn missing_count(&self) -> u32 {
        self.missing_indices.len() as u32
    }

    /// 페이지 전체가 비어 있는 경우
    pub const fn is_empty_page(&self) -> bool {
        self.actual_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_incomplete_and_failed_are_retried() {
        assert!(PageState::Failed.needs_retry());
        assert!(PageState::Incomplete.needs_retry());
        assert!(!PageState::Success.needs_retry());
        assert!(!PageState::Waiting.needs_retry());
        assert!(!PageState::Attempting.is_settled());
    }
}
