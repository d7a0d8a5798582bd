//! Page windows over a user's jobs and ledger entries.

use serde::{Deserialize, Serialize};

use crate::error::{AutoApplyError, ErrorCode, ErrorDetails, Result};

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;
/// Highest page whose offset still fits a signed 64-bit OFFSET at any page size.
pub const MAX_PAGE: u64 = i64::MAX as u64 / MAX_PAGE_SIZE;

/// Requested window: 1-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetPagination {
    pub page: u64,
    pub per_page: u64,
}

impl Default for OffsetPagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PAGE_SIZE,
        }
    }
}

impl OffsetPagination {
    /// Build a window, pulling both values into range.
    pub fn new(page: u64, per_page: u64) -> Self {
        Self {
            page: page.clamp(1, MAX_PAGE),
            per_page: per_page.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Rows to skip.
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.per_page)
    }

    pub fn limit(&self) -> u64 {
        self.per_page
    }

    /// Check a window that bypassed [`OffsetPagination::new`], e.g. one deserialized from a query string.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PAGE).contains(&self.page) {
            return Err(invalid("page", format!("must be between 1 and {}", MAX_PAGE)));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.per_page) {
            return Err(invalid("per_page", format!("must be between 1 and {}", MAX_PAGE_SIZE)));
        }
        Ok(())
    }

    /// Cut this window out of an already ordered sequence.
    pub fn slice<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(usize::try_from(self.offset()).unwrap_or(usize::MAX))
            .take(usize::try_from(self.per_page).unwrap_or(usize::MAX))
            .collect()
    }

    pub fn metadata(&self, total_items: u64) -> PageMetadata {
        let total_pages = total_items.div_ceil(self.per_page).max(1);
        PageMetadata {
            page: self.page,
            per_page: self.per_page,
            total_items,
            total_pages,
            has_previous: self.page > 1,
            has_next: self.page < total_pages,
        }
    }
}

fn invalid(field: &str, message: String) -> AutoApplyError {
    AutoApplyError::new(ErrorCode::InvalidInput, format!("{}: {}", field, message))
        .with_details(ErrorDetails::new().with_field(field))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page: u64,
    pub per_page: u64,
    pub total_items: u64,
    /// At least 1, even for an empty result
    pub total_pages: u64,
    pub has_previous: bool,
    pub has_next: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PageMetadata,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, pagination: &OffsetPagination, total_items: u64) -> Self {
        Self {
            items,
            meta: pagination.metadata(total_items),
        }
    }
}
