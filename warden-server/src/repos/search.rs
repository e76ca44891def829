use crate::error::{Error, ErrorType};

/// Free-text filter bound to a fixed tuple of columns.
///
/// The search string is split on spaces and the words are folded into a
/// single substring pattern, so `foo bar` matches a column containing
/// `foo` followed by `bar`. `None` and the empty string both match
/// everything.
pub struct SearchFilter {
    columns: &'static [&'static str],
}

impl SearchFilter {
    #[must_use]
    pub const fn new(columns: &'static [&'static str]) -> Self {
        Self { columns }
    }

    /// SQL predicate and bind values for the given search input.
    #[must_use]
    pub fn to_sql(&self, search: Option<&str>) -> (String, Vec<String>) {
        let search = match search {
            Some(search) => search,
            None => return ("true".to_string(), Vec::new()),
        };

        let words = search
            .split(' ')
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>();
        let pattern = if words.is_empty() {
            "%".to_string()
        } else {
            format!("%{}%", words.join("%"))
        };

        let predicates = self
            .columns
            .iter()
            .map(|column| format!("{column} LIKE ?"))
            .collect::<Vec<_>>()
            .join(" OR ");

        (
            format!("({predicates})"),
            self.columns.iter().map(|_| pattern.clone()).collect(),
        )
    }
}

/// Exact-match filters AND-combined onto a tautology base, so an empty
/// filter matches everything.
#[derive(Debug, Default)]
pub struct StrictFilter {
    predicates: Vec<String>,
    binds: Vec<String>,
}

impl StrictFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn equals(mut self, column: &str, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.predicates.push(format!("{column} = ?"));
            self.binds.push(value.to_string());
        }
        self
    }

    #[must_use]
    pub fn to_sql(self) -> (String, Vec<String>) {
        if self.predicates.is_empty() {
            ("true".to_string(), Vec::new())
        } else {
            (self.predicates.join(" AND "), self.binds)
        }
    }
}

/// Raw pagination input as received from the list query grammar.
#[derive(Debug, Default, Clone)]
pub struct Pagination {
    pub order: Option<String>,
    pub direction: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

/// Validates pagination input against a declared set of sortable columns
/// and renders the trailing ORDER BY / LIMIT / OFFSET clauses.
pub struct Paginator {
    column_map: &'static [(&'static str, &'static str)],
}

impl Paginator {
    #[must_use]
    pub const fn new(column_map: &'static [(&'static str, &'static str)]) -> Self {
        Self { column_map }
    }

    pub fn to_sql(&self, pagination: &Pagination) -> Result<String, Error> {
        let mut sql = String::new();

        if let (Some(order), Some(direction)) = (&pagination.order, &pagination.direction) {
            let column = self
                .column_map
                .iter()
                .find(|(name, _)| *name == order.as_str())
                .map(|(_, column)| *column)
                .ok_or_else(|| ErrorType::InvalidSortColumn(order.clone()))?;

            let direction = match direction.as_str() {
                "asc" => "ASC",
                "desc" => "DESC",
                _ => return Err(ErrorType::InvalidSortDirection(direction.clone()).into()),
            };

            sql.push_str(&format!(" ORDER BY {column} {direction}"));
        }

        let limit = pagination
            .limit
            .as_deref()
            .map(|value| parse_page_bound(value, ErrorType::InvalidLimit))
            .transpose()?;
        let offset = pagination
            .offset
            .as_deref()
            .map(|value| parse_page_bound(value, ErrorType::InvalidOffset))
            .transpose()?;

        match (limit, offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            // SQLite requires a LIMIT clause before OFFSET
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        Ok(sql)
    }
}

fn parse_page_bound(value: &str, make_error: fn(String) -> ErrorType) -> Result<i64, Error> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|parsed| *parsed >= 0)
        .ok_or_else(|| make_error(value.to_string()).into())
}

/// Result of a compound list query: `total` ignores the search and strict
/// filters, `filtered` reflects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage<T> {
    pub total: i64,
    pub filtered: i64,
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;

    const PAGINATOR: Paginator = Paginator::new(&[("name", "G.name"), ("uuid", "G.uuid")]);

    fn pagination(
        order: Option<&str>,
        direction: Option<&str>,
        limit: Option<&str>,
        offset: Option<&str>,
    ) -> Pagination {
        Pagination {
            order: order.map(ToString::to_string),
            direction: direction.map(ToString::to_string),
            limit: limit.map(ToString::to_string),
            offset: offset.map(ToString::to_string),
        }
    }

    #[test]
    fn search_filter_matches_all_without_input() {
        let filter = SearchFilter::new(&["U.username", "E.address"]);

        let (sql, binds) = filter.to_sql(None);
        assert_eq!(sql, "true");
        assert!(binds.is_empty());

        let (sql, binds) = filter.to_sql(Some(""));
        assert_eq!(sql, "(U.username LIKE ? OR E.address LIKE ?)");
        assert_eq!(binds, vec!["%".to_string(), "%".to_string()]);
    }

    #[test]
    fn search_filter_folds_words_into_one_pattern() {
        let filter = SearchFilter::new(&["P.name"]);

        let (sql, binds) = filter.to_sql(Some("foo  bar"));
        assert_eq!(sql, "(P.name LIKE ?)");
        assert_eq!(binds, vec!["%foo%bar%".to_string()]);
    }

    #[test]
    fn strict_filter_combines_with_and() {
        let (sql, binds) = StrictFilter::new()
            .equals("U.uuid", Some("the-uuid"))
            .equals("U.username", None)
            .equals("E.address", Some("foo@example.com"))
            .to_sql();
        assert_eq!(sql, "U.uuid = ? AND E.address = ?");
        assert_eq!(binds, vec!["the-uuid".to_string(), "foo@example.com".to_string()]);

        let (sql, binds) = StrictFilter::new().to_sql();
        assert_eq!(sql, "true");
        assert!(binds.is_empty());
    }

    #[test]
    fn paginator_renders_order_and_bounds() {
        let sql = PAGINATOR
            .to_sql(&pagination(Some("name"), Some("desc"), Some("10"), Some("5")))
            .unwrap();
        assert_eq!(sql, " ORDER BY G.name DESC LIMIT 10 OFFSET 5");

        // Ordering requires both order and direction
        let sql = PAGINATOR
            .to_sql(&pagination(Some("name"), None, None, None))
            .unwrap();
        assert_eq!(sql, "");

        let sql = PAGINATOR
            .to_sql(&pagination(None, None, None, Some("3")))
            .unwrap();
        assert_eq!(sql, " LIMIT -1 OFFSET 3");
    }

    #[test]
    fn paginator_rejects_unknown_sort_column() {
        let err = PAGINATOR
            .to_sql(&pagination(Some("password"), Some("asc"), None, None))
            .unwrap_err();
        assert!(matches!(err.variant, ErrorType::InvalidSortColumn(_)));
    }

    #[test]
    fn paginator_rejects_bad_sort_direction() {
        let err = PAGINATOR
            .to_sql(&pagination(Some("name"), Some("sideways"), None, None))
            .unwrap_err();
        assert!(matches!(err.variant, ErrorType::InvalidSortDirection(_)));
    }

    #[test]
    fn paginator_rejects_invalid_bounds() {
        for bad in ["-1", "true", "false", "nan", "1.5"] {
            let err = PAGINATOR
                .to_sql(&pagination(None, None, Some(bad), None))
                .unwrap_err();
            assert!(matches!(err.variant, ErrorType::InvalidLimit(_)), "{bad}");

            let err = PAGINATOR
                .to_sql(&pagination(None, None, None, Some(bad)))
                .unwrap_err();
            assert!(matches!(err.variant, ErrorType::InvalidOffset(_)), "{bad}");
        }
    }
}
