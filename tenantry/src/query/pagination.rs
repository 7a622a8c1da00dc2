//! Pagination windows and paged result envelopes
//!
//! # Example
//!
//! ```rust
//! use tenantry::query::Pagination;
//!
//! let page3 = Pagination::page(3, 10);
//! assert_eq!(page3.offset, 20);
//! assert_eq!(page3.limit, 10);
//! ```

use serde::{Deserialize, Serialize};

/// Offset/limit window applied to root rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Number of results to skip
    pub offset: u64,
    /// Maximum number of results to return
    pub limit: u64,
}

impl Pagination {
    #[must_use]
    pub const fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Window for the first page with the given limit
    #[must_use]
    pub const fn first_page(limit: u64) -> Self {
        Self { offset: 0, limit }
    }

    /// Window for a 1-based page number; page 0 is treated as page 1
    ///
    /// The offset saturates, so an out-of-range page yields an empty window.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tenantry::query::Pagination;
    ///
    /// assert_eq!(Pagination::page(0, 10).offset, 0);
    /// assert_eq!(Pagination::page(1, 10).offset, 0);
    /// assert_eq!(Pagination::page(3, 10).offset, 20);
    /// ```
    #[must_use]
    pub const fn page(page_number: u64, page_size: u64) -> Self {
        let offset = page_number.saturating_sub(1).saturating_mul(page_size);
        Self {
            offset,
            limit: page_size,
        }
    }
}

/// Rows of one page plus the unpaged total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paginated<T> {
    pub rows: Vec<T>,
    pub total_count: u64,
}

/// Response envelope for a paged query
///
/// `pages` is `ceil(total / limit)`, or 1 when no limit was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse<T> {
    pub results: Vec<T>,
    pub page: u64,
    pub limit: Option<u64>,
    pub pages: u64,
    pub total: u64,
}

impl<T> QueryResponse<T> {
    pub fn new(results: Vec<T>, page: u64, limit: Option<u64>, total: u64) -> Self {
        let pages = match limit {
            Some(limit) if limit > 0 => total.div_ceil(limit),
            _ => 1,
        };
        Self {
            results,
            page: page.max(1),
            limit,
            pages,
            total,
        }
    }

    pub fn from_paginated(paginated: Paginated<T>, page: u64, limit: Option<u64>) -> Self {
        Self::new(paginated.rows, page, limit, paginated.total_count)
    }

    /// Convert the result type, keeping the envelope
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> QueryResponse<U> {
        QueryResponse {
            results: self.results.into_iter().map(f).collect(),
            page: self.page,
            limit: self.limit,
            pages: self.pages,
            total: self.total,
        }
    }
}
