//! Operation listing parameters.

use serde::{Deserialize, Serialize};

use purse_core::{Entity, Operation};

/// Default page size for operation listings.
pub const DEFAULT_LIMIT: u32 = 10;

/// Hard cap on page size.
pub const MAX_LIMIT: u32 = 1000;

/// Pagination parameters for operation listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of operations to return.
    pub limit: u32,
    /// Number of operations to skip (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Column an operation listing is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Creation time.
    #[default]
    Date,
    /// Operation amount.
    Value,
}

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::Value => "value",
        }
    }
}

impl core::str::FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "date" => Ok(Self::Date),
            "value" => Ok(Self::Value),
            other => Err(format!("unknown sort key `{other}` (expected `date` or `value`)")),
        }
    }
}

/// A page request over one user's operations.
///
/// Ties on the sort key are broken by operation id in the same direction, so
/// paging is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationQuery {
    pub pagination: Pagination,
    pub sort: SortKey,
    pub descending: bool,
}

impl Default for OperationQuery {
    fn default() -> Self {
        Self {
            pagination: Pagination::default(),
            sort: SortKey::Date,
            descending: true,
        }
    }
}

impl OperationQuery {
    /// Order and page an in-memory list of operations with the same rules the
    /// SQL backend applies.
    pub fn apply(&self, mut operations: Vec<Operation>) -> Vec<Operation> {
        operations.sort_by(|a, b| {
            let ordering = match self.sort {
                SortKey::Date => a.created_at().cmp(&b.created_at()),
                SortKey::Value => a.amount().cmp(&b.amount()),
            }
            .then_with(|| a.id().cmp(b.id()));
            if self.descending { ordering.reverse() } else { ordering }
        });

        operations
            .into_iter()
            .skip(self.pagination.offset as usize)
            .take(self.pagination.limit as usize)
            .collect()
    }
}
