//! Limit/offset pagination for the pipeline list endpoints.
//!
//! Listings are ordered by `created_at` (v7 ids make this stable), so plain
//! limit/offset pages are deterministic without cursor bookkeeping.

use serde::Deserialize;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

/// A validated page request.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    /// Clamp raw query parameters into a usable page.
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

/// Raw pagination query parameters as they arrive on list endpoints.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<PageParams> for Page {
    fn from(params: PageParams) -> Self {
        Page::new(params.limit, params.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unspecified() {
        let page = Page::new(None, None);
        assert_eq!(page.limit, 50);
        assert_eq!(page.offset, 0);
    }

    #[test]
    fn clamps_out_of_range_values() {
        let page = Page::new(Some(10_000), Some(-5));
        assert_eq!(page.limit, 200);
        assert_eq!(page.offset, 0);

        let page = Page::new(Some(0), Some(30));
        assert_eq!(page.limit, 1);
        assert_eq!(page.offset, 30);
    }
}
