//! Destination for records: the trait the worker pool inserts through, and
//! its PostgreSQL implementation.

use super::source::{Header, Record};
use super::statement::{InsertStatement, TargetColumn};
use sqlx::PgPool;
use std::future::Future;
use thiserror::Error;

/// SQLSTATE classes worth another attempt: connection exception, transaction
/// rollback (serialization failure, deadlock), insufficient resources and
/// operator intervention.
const TRANSIENT_SQLSTATE_CLASSES: [&str; 4] = ["08", "40", "53", "57"];
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// Class 08 but not a connection problem: the server rejects a bind whose
/// parameter count does not match the statement, e.g. a short or long row.
const PROTOCOL_VIOLATION: &str = "08P01";

/// Columns of an ordinary or partitioned table, exact relation name first,
/// then the name an unquoted identifier folds to.
const TABLE_COLUMNS_QUERY: &str = r#"
SELECT c.oid::regclass::text, a.attname::text, format_type(a.atttypid, a.atttypmod)
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_attribute a ON a.attrelid = c.oid
WHERE c.relkind IN ('r', 'p')
  AND c.relname IN ($2, lower($2))
  AND CASE WHEN $1::text IS NULL THEN pg_table_is_visible(c.oid) ELSE n.nspname = $1 END
  AND a.attnum > 0
  AND NOT a.attisdropped
ORDER BY c.relname = $2 DESC, a.attnum
"#;

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("could not acquire a database connection: {0}")]
    Acquire(#[source] sqlx::Error),
    #[error("transient insert failure: {0}")]
    Transient(String),
    #[error("insert rejected: {0}")]
    Permanent(String),
    /// The attempt panicked; treated like a transient failure.
    #[error("insert attempt faulted: {0}")]
    Fault(String),
}

impl InsertError {
    /// Failures that end the run rather than the record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InsertError::Acquire(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, InsertError::Transient(_) | InsertError::Fault(_))
    }

    /// Classify an error raised while executing the statement.
    pub fn from_execution(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Database(db_err) => db_err
                .code()
                .is_some_and(|code| is_transient_sqlstate(&code)),
            sqlx::Error::Io(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => true,
            _ => false,
        };

        if transient {
            InsertError::Transient(err.to_string())
        } else {
            InsertError::Permanent(err.to_string())
        }
    }
}

/// Whether a server error code is worth another attempt.
pub fn is_transient_sqlstate(code: &str) -> bool {
    if code == PROTOCOL_VIOLATION {
        return false;
    }
    code == LOCK_NOT_AVAILABLE
        || TRANSIENT_SQLSTATE_CLASSES
            .iter()
            .any(|class| code.starts_with(class))
}

/// Something a worker can insert one record into.
///
/// Implementations are shared by every worker and must tolerate concurrent
/// calls. A connection, if any, is held only for the duration of one call.
pub trait RecordSink: Send + Sync + 'static {
    fn insert(&self, record: &Record) -> impl Future<Output = Result<(), InsertError>> + Send;
}

#[derive(Debug, Error)]
pub enum SinkSetupError {
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("column {column} does not exist in table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Inserts records into a PostgreSQL table through a shared pool.
pub struct PgSink {
    pool: PgPool,
    statement: InsertStatement,
}

impl PgSink {
    /// Resolve `table` and the header's columns against the catalog and build
    /// the INSERT statement every worker will run.
    ///
    /// `table` may be schema-qualified; otherwise the search path decides.
    pub async fn for_header(
        pool: PgPool,
        table: &str,
        header: &Header,
    ) -> Result<Self, SinkSetupError> {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        };

        let rows: Vec<(String, String, String)> = sqlx::query_as(TABLE_COLUMNS_QUERY)
            .bind(schema)
            .bind(name)
            .fetch_all(&pool)
            .await?;

        let relation = rows
            .first()
            .map(|(relation, _, _)| relation.clone())
            .ok_or_else(|| SinkSetupError::TableNotFound(table.to_string()))?;
        let catalog: Vec<(String, String)> = rows
            .into_iter()
            .filter(|(owner, _, _)| *owner == relation)
            .map(|(_, column, sql_type)| (column, sql_type))
            .collect();

        let columns = resolve_columns(&relation, header, &catalog)?;
        let statement = InsertStatement::build(&relation, &columns);
        log::debug!("insert statement: {}", statement.sql());

        Ok(Self { pool, statement })
    }

    pub fn statement(&self) -> &InsertStatement {
        &self.statement
    }
}

impl RecordSink for PgSink {
    async fn insert(&self, record: &Record) -> Result<(), InsertError> {
        let mut conn = self.pool.acquire().await.map_err(InsertError::Acquire)?;

        let mut query = sqlx::query(self.statement.sql());
        for field in &record.fields {
            query = query.bind(field.as_str());
        }

        let result = query.execute(&mut *conn).await;
        drop(conn); // Release connection

        result.map(|_| ()).map_err(InsertError::from_execution)
    }
}

/// Match header names to catalog columns: exact first, then the
/// case-folded name an unquoted identifier would have.
pub fn resolve_columns(
    relation: &str,
    header: &Header,
    catalog: &[(String, String)],
) -> Result<Vec<TargetColumn>, SinkSetupError> {
    header
        .columns()
        .iter()
        .map(|wanted| {
            catalog
                .iter()
                .find(|(name, _)| name == wanted)
                .or_else(|| {
                    let folded = wanted.to_lowercase();
                    catalog.iter().find(|(name, _)| *name == folded)
                })
                .map(|(name, sql_type)| TargetColumn::typed(name.clone(), sql_type.clone()))
                .ok_or_else(|| SinkSetupError::UnknownColumn {
                    table: relation.to_string(),
                    column: wanted.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<(String, String)> {
        vec![
            ("id".to_string(), "integer".to_string()),
            ("name".to_string(), "text".to_string()),
            ("Mixed".to_string(), "boolean".to_string()),
        ]
    }

    #[test]
    fn columns_resolve_exactly_then_case_folded() {
        let header = Header::new(["ID", "name", "Mixed"]);
        let columns = resolve_columns("items", &header, &catalog()).unwrap();

        assert_eq!(
            columns,
            vec![
                TargetColumn::typed("id", "integer"),
                TargetColumn::typed("name", "text"),
                TargetColumn::typed("Mixed", "boolean"),
            ]
        );
    }

    #[test]
    fn unknown_column_fails_setup() {
        let header = Header::new(["id", "missing"]);
        let err = resolve_columns("items", &header, &catalog()).unwrap_err();
        assert!(matches!(
            err,
            SinkSetupError::UnknownColumn { ref column, .. } if column == "missing"
        ));
    }

    #[test]
    fn pool_errors_during_execution_are_transient() {
        assert!(InsertError::from_execution(sqlx::Error::PoolTimedOut).is_transient());
        assert!(
            InsertError::from_execution(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            )))
            .is_transient()
        );
    }

    #[test]
    fn sqlstate_classification() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("55P03"));
        assert!(is_transient_sqlstate("57P01"));
        assert!(!is_transient_sqlstate("08P01"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("22P02"));
        assert!(!is_transient_sqlstate("42703"));
    }

    #[test]
    fn faults_are_retryable_but_not_fatal() {
        let fault = InsertError::Fault("driver fault".into());
        assert!(fault.is_transient());
        assert!(!fault.is_fatal());
    }

    #[test]
    fn decode_errors_are_permanent() {
        let err = InsertError::from_execution(sqlx::Error::ColumnNotFound("x".into()));
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn only_acquisition_is_fatal() {
        assert!(InsertError::Acquire(sqlx::Error::PoolClosed).is_fatal());
        assert!(!InsertError::Transient("x".into()).is_fatal());
        assert!(!InsertError::Permanent("x".into()).is_fatal());
    }
}
