//! Keyset pagination shared by every listing operation.
//!
//! A listing is described by an [`EntityDescriptor`] (which column carries the
//! cursor and how to read it back from a row) and a [`PaginationParams`]
//! request. [`KeysetQuery::plan`] turns the two into the bounds a backend must
//! apply; [`paginate`] turns the rows it returned into a page and a
//! [`Paginator`].
//!
//! ## Boundary technique
//!
//! For a page of `N` the backend is asked for `N + 1` rows. If it returns all
//! of them there is at least one more page: the extra row is dropped and the
//! cursor of the last *returned* row becomes the next page token. This avoids
//! a separate `COUNT` round trip.

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// Upper bound on the number of rows returned by one page. An unbounded
/// request gets pages of this size and a next page token while rows remain.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Page size used when a request does not name one.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Request side of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationParams {
    /// Return only rows whose cursor is strictly greater than this.
    pub after: String,
    /// Requested page size; negative means unbounded.
    pub amount: i64,
    /// Return only rows whose cursor starts with this.
    pub prefix: String,
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            after: String::new(),
            amount: DEFAULT_PAGE_SIZE,
            prefix: String::new(),
        }
    }
}

impl PaginationParams {
    /// Unbounded request for the full set.
    pub fn all() -> Self {
        Self {
            amount: -1,
            ..Default::default()
        }
    }

    pub fn first(amount: i64) -> Self {
        Self {
            amount,
            ..Default::default()
        }
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.after = cursor.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.amount < 0
    }

    /// Effective page size. Unbounded and oversized requests are clamped to
    /// [`MAX_PAGE_SIZE`].
    fn page_size(&self) -> usize {
        usize::try_from(self.amount)
            .unwrap_or(MAX_PAGE_SIZE)
            .min(MAX_PAGE_SIZE)
    }
}

/// Response side of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paginator {
    /// Number of rows in this page.
    pub amount: usize,
    /// Cursor for the next page, empty when exhausted.
    pub next_page_token: String,
}

impl Paginator {
    pub fn has_more(&self) -> bool {
        !self.next_page_token.is_empty()
    }
}

/// A page of rows plus its paginator.
pub type Page<T> = (Vec<T>, Paginator);

/// Per-entity description of how a listing is keyed.
///
/// Supplied at the call site instead of discovering the cursor field at
/// runtime.
pub struct EntityDescriptor<T: 'static> {
    /// Entity name used in diagnostics.
    pub entity: &'static str,
    /// Columns the entity exposes.
    pub columns: &'static [&'static str],
    /// Column ordering the listing; must have unique values.
    pub cursor_column: &'static str,
    /// Reads the cursor value back from a row.
    pub cursor: fn(&T) -> &str,
}

impl<T> core::fmt::Debug for EntityDescriptor<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("entity", &self.entity)
            .field("columns", &self.columns)
            .field("cursor_column", &self.cursor_column)
            .finish()
    }
}

impl<T> EntityDescriptor<T> {
    pub fn cursor_of<'a>(&self, row: &'a T) -> &'a str {
        (self.cursor)(row)
    }
}

/// Bounds a backend applies to one listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetQuery {
    pub cursor_column: &'static str,
    pub after: String,
    pub prefix: String,
    /// Maximum number of rows to return, already including the boundary row.
    pub limit: usize,
}

impl KeysetQuery {
    /// Plan a listing of `descriptor` for `params`.
    ///
    /// Fails with [`AuthError::Config`] when the cursor column is not one of
    /// the descriptor's columns.
    pub fn plan<T>(descriptor: &EntityDescriptor<T>, params: &PaginationParams) -> AuthResult<Self> {
        if !descriptor.columns.contains(&descriptor.cursor_column) {
            return Err(AuthError::config(format!(
                "no column '{}' on {}",
                descriptor.cursor_column, descriptor.entity
            )));
        }

        let limit = match params.page_size() {
            0 => 0,
            n => n + 1,
        };

        Ok(Self {
            cursor_column: descriptor.cursor_column,
            after: params.after.clone(),
            prefix: params.prefix.clone(),
            limit,
        })
    }

    /// Whether a row with cursor `key` falls inside the bounds.
    pub fn admits(&self, key: &str) -> bool {
        key > self.after.as_str() && key.starts_with(self.prefix.as_str())
    }

    /// Apply the bounds to an unordered set of rows.
    ///
    /// Backends without a query engine use this to produce exactly what a
    /// relational backend returns for the same query.
    pub fn select<T>(&self, descriptor: &EntityDescriptor<T>, rows: impl IntoIterator<Item = T>) -> Vec<T> {
        let mut selected: Vec<T> = rows
            .into_iter()
            .filter(|row| self.admits(descriptor.cursor_of(row)))
            .collect();
        selected.sort_by(|a, b| descriptor.cursor_of(a).cmp(descriptor.cursor_of(b)));
        selected.truncate(self.limit);
        selected
    }
}

/// Turn the rows fetched for `params` into a page.
///
/// `rows` must be the backend's answer to `KeysetQuery::plan(descriptor, params)`.
pub fn paginate<T>(descriptor: &EntityDescriptor<T>, params: &PaginationParams, mut rows: Vec<T>) -> Page<T> {
    let mut next_page_token = String::new();
    let size = params.page_size();
    if rows.len() > size {
        rows.truncate(size);
        if let Some(last) = rows.last() {
            next_page_token = descriptor.cursor_of(last).to_string();
        }
    }

    let paginator = Paginator {
        amount: rows.len(),
        next_page_token,
    };
    (rows, paginator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Row {
        name: String,
    }

    static ROWS: EntityDescriptor<Row> = EntityDescriptor {
        entity: "row",
        columns: &["id", "name"],
        cursor_column: "name",
        cursor: |r| r.name.as_str(),
    };

    fn rows(names: &[&str]) -> Vec<Row> {
        names
            .iter()
            .map(|n| Row {
                name: n.to_string(),
            })
            .collect()
    }

    fn list(all: &[Row], params: &PaginationParams) -> Page<Row> {
        let query = KeysetQuery::plan(&ROWS, params).unwrap();
        let fetched = query.select(&ROWS, all.iter().cloned());
        paginate(&ROWS, params, fetched)
    }

    #[test]
    fn unknown_cursor_column_is_a_config_error() {
        let broken: EntityDescriptor<Row> = EntityDescriptor {
            entity: "row",
            columns: &["id"],
            cursor_column: "name",
            cursor: |r| r.name.as_str(),
        };
        let err = KeysetQuery::plan(&broken, &PaginationParams::default()).unwrap_err();
        assert!(matches!(err, AuthError::Config(_)));
    }

    #[test]
    fn boundary_row_sets_next_token() {
        let all = rows(&["c", "a", "d", "b"]);
        let (page, p) = list(&all, &PaginationParams::first(2));
        assert_eq!(page, rows(&["a", "b"]));
        assert_eq!(p.amount, 2);
        assert_eq!(p.next_page_token, "b");

        let (page, p) = list(&all, &PaginationParams::first(2).after("b"));
        assert_eq!(page, rows(&["c", "d"]));
        assert!(!p.has_more());
    }

    #[test]
    fn prefix_filters_before_limit() {
        let all = rows(&["alpha", "beta", "alpine", "bravo"]);
        let (page, p) = list(&all, &PaginationParams::first(10).with_prefix("al"));
        assert_eq!(page, rows(&["alpha", "alpine"]));
        assert_eq!(p.amount, 2);
    }

    #[test]
    fn unbounded_is_paged_at_max_size() {
        let all: Vec<Row> = (0..MAX_PAGE_SIZE + 10)
            .map(|i| Row {
                name: format!("{i:05}"),
            })
            .collect();
        let (page, p) = list(&all, &PaginationParams::all());
        assert_eq!(page.len(), MAX_PAGE_SIZE);
        assert_eq!(p.next_page_token, page[MAX_PAGE_SIZE - 1].name);

        let (rest, p) = list(&all, &PaginationParams::all().after(p.next_page_token));
        assert_eq!(rest.len(), 10);
        assert!(p.next_page_token.is_empty());
    }

    #[test]
    fn unbounded_fitting_in_one_page_has_no_token() {
        let all: Vec<Row> = (0..MAX_PAGE_SIZE)
            .map(|i| Row {
                name: format!("{i:05}"),
            })
            .collect();
        let (page, p) = list(&all, &PaginationParams::all());
        assert_eq!(page.len(), MAX_PAGE_SIZE);
        assert!(p.next_page_token.is_empty());
    }

    #[test]
    fn oversized_page_is_clamped_and_continues() {
        let all: Vec<Row> = (0..MAX_PAGE_SIZE + 10)
            .map(|i| Row {
                name: format!("{i:05}"),
            })
            .collect();
        let (page, p) = list(&all, &PaginationParams::first(5000));
        assert_eq!(page.len(), MAX_PAGE_SIZE);
        assert_eq!(p.next_page_token, page[MAX_PAGE_SIZE - 1].name);
    }

    #[test]
    fn zero_amount_returns_nothing() {
        let all = rows(&["a", "b"]);
        let (page, p) = list(&all, &PaginationParams::first(0));
        assert!(page.is_empty());
        assert_eq!(p, Paginator::default());
    }

    proptest! {
        #[test]
        fn page_never_exceeds_amount(
            names in proptest::collection::btree_set("[a-e]{1,3}", 0..40),
            amount in 1i64..15,
        ) {
            let all: Vec<Row> = names.iter().map(|n| Row { name: n.clone() }).collect();
            let mut params = PaginationParams::first(amount);
            let mut seen = Vec::new();
            loop {
                let (page, p) = list(&all, &params);
                prop_assert!(page.len() as i64 <= amount);
                prop_assert_eq!(p.amount, page.len());
                let remaining = all.iter().filter(|r| r.name > params.after).count();
                if remaining > page.len() {
                    prop_assert_eq!(&p.next_page_token, &page.last().unwrap().name);
                } else {
                    prop_assert!(p.next_page_token.is_empty());
                }
                seen.extend(page);
                if !p.has_more() {
                    break;
                }
                params = params.after(p.next_page_token);
            }
            let expected: Vec<Row> = names.into_iter().map(|name| Row { name }).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
