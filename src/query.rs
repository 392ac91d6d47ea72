//! Statement identity and the per-statement state kept in the cache.

// Standard library imports
use std::fmt;

// Internal crate imports
use crate::cache::{CanEstimateSize, CreateAction};
use crate::errors::Error;

/// Columns a statement asked the server to return.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Returning {
    /// Plain statement, nothing extra requested.
    Nothing,
    /// Whatever generated columns are sensible for the target table.
    Generated,
    Columns(Vec<String>),
}

/// Identity of a statement in the cache. Variants never compare equal to
/// each other, even when their SQL text matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// Parameterized SQL with no extra result columns.
    Sql(String),
    Base {
        sql: String,
        is_parameterized: bool,
        escape_processing: bool,
    },
    WithReturningColumns {
        sql: String,
        is_parameterized: bool,
        escape_processing: bool,
        columns: Option<Vec<String>>,
    },
    /// A `{call ...}` style invocation.
    Callable(String),
}

impl QueryKey {
    pub fn new(
        sql: &str,
        escape_processing: bool,
        is_parameterized: bool,
        returning: Returning,
    ) -> QueryKey {
        match returning {
            Returning::Generated => QueryKey::WithReturningColumns {
                sql: sql.to_string(),
                is_parameterized,
                escape_processing,
                columns: None,
            },
            Returning::Columns(columns) if !columns.is_empty() => {
                QueryKey::WithReturningColumns {
                    sql: sql.to_string(),
                    is_parameterized,
                    escape_processing,
                    columns: Some(columns),
                }
            }
            _ if is_parameterized => QueryKey::Sql(sql.to_string()),
            _ => QueryKey::Base {
                sql: sql.to_string(),
                is_parameterized: false,
                escape_processing,
            },
        }
    }

    pub fn callable(sql: &str) -> QueryKey {
        QueryKey::Callable(sql.to_string())
    }

    pub fn sql(&self) -> &str {
        match self {
            QueryKey::Sql(sql)
            | QueryKey::Base { sql, .. }
            | QueryKey::WithReturningColumns { sql, .. }
            | QueryKey::Callable(sql) => sql,
        }
    }

    pub fn is_parameterized(&self) -> bool {
        match self {
            QueryKey::Sql(_) | QueryKey::Callable(_) => true,
            QueryKey::Base {
                is_parameterized, ..
            }
            | QueryKey::WithReturningColumns {
                is_parameterized, ..
            } => *is_parameterized,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, QueryKey::Callable(_))
    }
}

impl CanEstimateSize for QueryKey {
    // Two bytes per character plus object overhead.
    fn size(&self) -> usize {
        match self {
            QueryKey::Sql(sql) => sql.len() * 2,
            QueryKey::Base { sql, .. } | QueryKey::Callable(sql) => 16 + sql.len() * 2,
            QueryKey::WithReturningColumns { sql, columns, .. } => {
                let mut size = 16 + sql.len() * 2 + 16;
                if let Some(columns) = columns {
                    size += 16;
                    size += columns.iter().map(|c| c.len() * 2).sum::<usize>();
                }
                size
            }
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::WithReturningColumns {
                sql,
                columns: Some(columns),
                ..
            } => write!(f, "{sql} RETURNING {}", columns.join(", ")),
            QueryKey::WithReturningColumns { sql, .. } => write!(f, "{sql} RETURNING *"),
            other => write!(f, "{}", other.sql()),
        }
    }
}

/// SQL as it goes on the wire, placeholders already in `$n` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeQuery {
    pub sql: String,
}

impl NativeQuery {
    pub fn new(sql: &str) -> NativeQuery {
        NativeQuery {
            sql: sql.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }
}

/// A statement together with what the server knows about it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub key: QueryKey,
    pub query: NativeQuery,
    pub is_function: bool,
    /// Server-side name once a named Parse went through.
    statement_name: Option<String>,
    /// Connection deallocate epoch the statement was prepared in.
    prepared_epoch: u64,
    execute_count: usize,
    /// Rows per Execute, 0 fetches everything.
    pub fetch_size: i32,
    /// Set when the last Execute ended in PortalSuspended.
    pub portal_suspended: bool,
}

impl CachedQuery {
    pub fn new(key: QueryKey, query: NativeQuery) -> CachedQuery {
        let is_function = key.is_callable();
        CachedQuery {
            key,
            query,
            is_function,
            statement_name: None,
            prepared_epoch: 0,
            execute_count: 0,
            fetch_size: 0,
            portal_suspended: false,
        }
    }

    pub fn increase_execute_count(&mut self) {
        self.execute_count = self.execute_count.saturating_add(1);
    }

    pub fn execute_count(&self) -> usize {
        self.execute_count
    }

    pub fn statement_name(&self) -> Option<&str> {
        self.statement_name.as_deref()
    }

    pub fn is_prepared(&self) -> bool {
        self.statement_name.is_some()
    }

    /// False once the server dropped every statement after this one was prepared.
    pub fn is_prepared_in(&self, epoch: u64) -> bool {
        self.is_prepared() && self.prepared_epoch == epoch
    }

    pub fn set_prepared(&mut self, name: String, epoch: u64) {
        self.statement_name = Some(name);
        self.prepared_epoch = epoch;
    }

    /// Forget the server-side statement. Returns the name that was dropped.
    pub fn unprepare(&mut self) -> Option<String> {
        self.statement_name.take()
    }
}

impl CanEstimateSize for CachedQuery {
    fn size(&self) -> usize {
        // Original text and native SQL, plus map entry and wrapper overhead.
        self.key.size() * 2 + 100
    }
}

/// Default create action: the key's text is used as the native query.
pub fn create_action() -> CreateAction<QueryKey, CachedQuery> {
    Box::new(|key: &QueryKey| {
        if key.sql().contains('\0') {
            return Err(Error::StatementCreation(
                "Zero bytes may not occur in SQL text".to_string(),
            ));
        }
        let sql = match key {
            QueryKey::Callable(sql) => callable_sql(sql),
            other => other.sql().to_string(),
        };
        Ok(CachedQuery::new(key.clone(), NativeQuery::new(&sql)))
    })
}

/// Turn `{call f(...)}` / `{? = call f(...)}` into a plain `select * from f(...)`.
fn callable_sql(sql: &str) -> String {
    let trimmed = sql.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .map(str::trim);
    let Some(inner) = inner else {
        return trimmed.to_string();
    };
    let inner = match inner.strip_prefix('?') {
        Some(rest) => rest.trim_start().trim_start_matches('=').trim_start(),
        None => inner,
    };
    match inner
        .get(..4)
        .filter(|prefix| prefix.eq_ignore_ascii_case("call"))
    {
        Some(_) => format!("select * from {}", inner[4..].trim()),
        None => trimmed.to_string(),
    }
}
