use polars::prelude::*;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, error, info};

use crate::error::{AppError, Result};
use crate::models::ColumnKind;
use crate::services::frame::{column_kind, numeric_values, text_values};

const MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    MySql,
    PostgreSql,
}

impl FromStr for DatabaseKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(DatabaseKind::Sqlite),
            "mysql" => Ok(DatabaseKind::MySql),
            "postgresql" | "postgres" => Ok(DatabaseKind::PostgreSql),
            other => Err(AppError::Connection(format!("unsupported database kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    pub kind: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    #[default]
    Fail,
    Replace,
    Append,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub total_count: i64,
    pub non_null_count: i64,
    pub null_count: i64,
    pub unique_count: i64,
    pub min_value: JsonValue,
    pub max_value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseInfo {
    pub kind: DatabaseKind,
    pub database: String,
    pub version: String,
    pub tables: Vec<String>,
    pub table_count: usize,
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_to_json(value: SqlValue) -> JsonValue {
    match value {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Integer(i) => i.into(),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        SqlValue::Text(t) => JsonValue::String(t),
        SqlValue::Blob(b) => JsonValue::String(format!("<{} bytes>", b.len())),
    }
}

fn unique_names(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|base| {
            let mut name = base.clone();
            let mut counter = 1;
            while !seen.insert(name.clone()) {
                name = format!("{}.{}", base, counter);
                counter += 1;
            }
            name
        })
        .collect()
}

/// Integer columns stay Int64, mixed numbers become Float64, anything else text.
fn build_series(name: &str, cells: &[SqlValue]) -> Series {
    let present = || cells.iter().filter(|c| !matches!(c, SqlValue::Null));
    if present().all(|c| matches!(c, SqlValue::Integer(_))) && present().next().is_some() {
        let values: Vec<Option<i64>> = cells
            .iter()
            .map(|c| match c {
                SqlValue::Integer(i) => Some(*i),
                _ => None,
            })
            .collect();
        return Series::new(name, values);
    }
    if present().all(|c| matches!(c, SqlValue::Integer(_) | SqlValue::Real(_))) && present().next().is_some() {
        let values: Vec<Option<f64>> = cells
            .iter()
            .map(|c| match c {
                SqlValue::Integer(i) => Some(*i as f64),
                SqlValue::Real(f) => Some(*f),
                _ => None,
            })
            .collect();
        return Series::new(name, values);
    }
    let values: Vec<Option<String>> = cells
        .iter()
        .map(|c| match c {
            SqlValue::Null => None,
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Real(f) => Some(f.to_string()),
            SqlValue::Text(t) => Some(t.clone()),
            SqlValue::Blob(b) => Some(format!("<{} bytes>", b.len())),
        })
        .collect();
    Series::new(name, values)
}

fn frame_from_statement(stmt: &mut Statement<'_>) -> Result<DataFrame> {
    let names = unique_names(stmt.column_names().into_iter().map(str::to_string).collect());
    let width = names.len();
    let mut columns: Vec<Vec<SqlValue>> = vec![Vec::new(); width];

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        for (i, column) in columns.iter_mut().enumerate() {
            column.push(row.get::<_, SqlValue>(i)?);
        }
    }

    let series: Vec<Series> = names
        .iter()
        .zip(columns.iter())
        .map(|(name, cells)| build_series(name, cells))
        .collect();
    Ok(DataFrame::new(series)?)
}

fn sql_type(series: &Series) -> &'static str {
    match series.dtype() {
        DataType::Boolean => "INTEGER",
        dt if dt.is_integer() => "INTEGER",
        dt if dt.is_float() => "REAL",
        _ => "TEXT",
    }
}

fn sql_values(series: &Series) -> Result<Vec<SqlValue>> {
    let to_sql = |v: Option<SqlValue>| v.unwrap_or(SqlValue::Null);
    Ok(match series.dtype() {
        DataType::Boolean => series
            .bool()?
            .into_iter()
            .map(|v| to_sql(v.map(|b| SqlValue::Integer(i64::from(b)))))
            .collect(),
        dt if dt.is_integer() => series
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .map(|v| to_sql(v.map(SqlValue::Integer)))
            .collect(),
        _ if column_kind(series) == ColumnKind::Numeric => numeric_values(series)?
            .into_iter()
            .map(|v| to_sql(v.map(SqlValue::Real)))
            .collect(),
        _ => text_values(series)?
            .into_iter()
            .map(|v| to_sql(v.map(SqlValue::Text)))
            .collect(),
    })
}

/// One open SQLite connection; every call runs to completion on it.
pub struct DbConnection {
    conn: Connection,
    kind: DatabaseKind,
    database: String,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("kind", &self.kind)
            .field("database", &self.database)
            .finish()
    }
}

impl DbConnection {
    pub fn connect(params: &ConnectParams) -> Result<Self> {
        let kind: DatabaseKind = params.kind.parse()?;
        info!(
            "Connecting to {:?} database {} (host {:?}, port {:?}, user {:?})",
            kind,
            params.database,
            params.host,
            params.port,
            params.user
        );
        match kind {
            DatabaseKind::Sqlite => Self::open_sqlite(&params.database),
            other => {
                error!("Rejected connection to unsupported kind {:?}", other);
                Err(AppError::Connection(format!(
                    "unsupported database kind '{}'",
                    params.kind
                )))
            }
        }
    }

    pub fn open_sqlite(database: &str) -> Result<Self> {
        if database.trim().is_empty() {
            return Err(AppError::Connection("a database path is required".to_string()));
        }
        let conn = if database == MEMORY_DATABASE {
            Connection::open_in_memory()
        } else {
            Connection::open(database)
        }
        .map_err(|e| {
            error!("Failed to open database {}: {}", database, e);
            AppError::Connection(e.to_string())
        })?;

        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| AppError::Connection(e.to_string()))?;
        debug!("Connected to {}", database);

        Ok(Self {
            conn,
            kind: DatabaseKind::Sqlite,
            database: database.to_string(),
        })
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    pub fn test_connection(&self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!("Found tables: {:?}", tables);
        Ok(tables)
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn require_table(&self, name: &str) -> Result<()> {
        if self.table_exists(name)? {
            Ok(())
        } else {
            error!("Table {} does not exist", name);
            Err(AppError::Query(format!("no such table: {}", name)))
        }
    }

    pub fn table_schema(&self, name: &str) -> Result<TableSchema> {
        self.require_table(name)?;
        let quoted = quote_identifier(name);

        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", quoted))?;
        let mut keyed: Vec<(i64, ColumnInfo)> = stmt
            .query_map([], |row| {
                let pk: i64 = row.get(5)?;
                Ok((
                    pk,
                    ColumnInfo {
                        name: row.get(1)?,
                        declared_type: row.get(2)?,
                        not_null: row.get::<_, i64>(3)? != 0,
                        default: row.get(4)?,
                        primary_key: pk > 0,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut pk_columns: Vec<(i64, String)> = keyed
            .iter()
            .filter(|(pk, _)| *pk > 0)
            .map(|(pk, col)| (*pk, col.name.clone()))
            .collect();
        pk_columns.sort();
        let primary_keys = pk_columns.into_iter().map(|(_, name)| name).collect();
        let columns = keyed.drain(..).map(|(_, col)| col).collect();

        let mut stmt = self.conn.prepare(&format!("PRAGMA foreign_key_list({})", quoted))?;
        let foreign_keys = stmt
            .query_map([], |row| {
                Ok(ForeignKey {
                    references_table: row.get(2)?,
                    column: row.get(3)?,
                    references_column: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(&format!("PRAGMA index_list({})", quoted))?;
        let index_heads: Vec<(String, bool)> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)? != 0)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut indexes = Vec::with_capacity(index_heads.len());
        for (index_name, unique) in index_heads {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA index_info({})", quote_identifier(&index_name)))?;
            let columns = stmt
                .query_map([], |row| row.get::<_, Option<String>>(2))?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect();
            indexes.push(IndexInfo {
                name: index_name,
                unique,
                columns,
            });
        }

        Ok(TableSchema {
            columns,
            primary_keys,
            foreign_keys,
            indexes,
        })
    }

    /// `filter` is a raw SQL condition appended as a WHERE clause.
    pub fn load_table(&self, name: &str, limit: Option<usize>, filter: Option<&str>) -> Result<DataFrame> {
        let mut sql = format!("SELECT * FROM {}", quote_identifier(name));
        if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        info!("Loading table {}", name);
        self.run_query(&sql)
    }

    /// Row-returning statements become a table; others report `rows_affected`.
    pub fn run_query(&self, sql: &str) -> Result<DataFrame> {
        debug!("Executing SQL: {}", sql);
        let mut stmt = self.conn.prepare(sql).map_err(|e| {
            error!("Failed to prepare query: {}", e);
            AppError::Query(e.to_string())
        })?;

        if stmt.column_count() == 0 {
            let affected = stmt.execute([])?;
            info!("Statement affected {} rows", affected);
            return Ok(DataFrame::new(vec![Series::new(
                "rows_affected",
                &[affected as i64],
            )])?);
        }

        let df = frame_from_statement(&mut stmt)?;
        info!("Query returned {} rows x {} columns", df.height(), df.width());
        Ok(df)
    }

    /// Creates the table from the frame's schema when needed and inserts every
    /// row in one transaction. Returns the number of rows written.
    pub fn write_table(&mut self, df: &DataFrame, name: &str, if_exists: IfExists) -> Result<usize> {
        let exists = self.table_exists(name)?;
        if exists && if_exists == IfExists::Fail {
            return Err(AppError::Query(format!("table '{}' already exists", name)));
        }
        let quoted = quote_identifier(name);
        let columns = df
            .get_columns()
            .iter()
            .map(sql_values)
            .collect::<Result<Vec<_>>>()?;

        let tx = self.conn.transaction()?;
        if exists && if_exists == IfExists::Replace {
            tx.execute(&format!("DROP TABLE {}", quoted), [])?;
        }
        if !exists || if_exists == IfExists::Replace {
            let definitions: Vec<String> = df
                .get_columns()
                .iter()
                .map(|s| format!("{} {}", quote_identifier(s.name()), sql_type(s)))
                .collect();
            let create = format!("CREATE TABLE {} ({})", quoted, definitions.join(", "));
            debug!("Create table SQL: {}", create);
            tx.execute(&create, [])?;
        }

        let names: Vec<String> = df.get_column_names().iter().map(|n| quote_identifier(n)).collect();
        let placeholders = vec!["?"; names.len()].join(", ");
        let insert = format!("INSERT INTO {} ({}) VALUES ({})", quoted, names.join(", "), placeholders);
        {
            let mut stmt = tx.prepare(&insert)?;
            for row in 0..df.height() {
                stmt.execute(params_from_iter(columns.iter().map(|column| &column[row])))
                    .map_err(|e| {
                        error!("Failed to insert row {}: {}", row, e);
                        AppError::Query(e.to_string())
                    })?;
            }
        }
        tx.commit()?;

        info!("Wrote {} rows into {} ({:?})", df.height(), name, if_exists);
        Ok(df.height())
    }

    pub fn row_count(&self, name: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(name));
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub fn column_stats(&self, name: &str, column: &str) -> Result<ColumnStats> {
        let c = quote_identifier(column);
        let sql = format!(
            "SELECT COUNT(*), COUNT({c}), COUNT(DISTINCT {c}), MIN({c}), MAX({c}) FROM {}",
            quote_identifier(name),
            c = c
        );
        let (total_count, non_null_count, unique_count, min, max) = self.conn.query_row(&sql, [], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, SqlValue>(3)?,
                row.get::<_, SqlValue>(4)?,
            ))
        })?;
        Ok(ColumnStats {
            total_count,
            non_null_count,
            null_count: total_count - non_null_count,
            unique_count,
            min_value: sql_to_json(min),
            max_value: sql_to_json(max),
        })
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.require_table(name)?;
        self.conn.execute(&format!("DROP TABLE {}", quote_identifier(name)), [])?;
        info!("Dropped table {}", name);
        Ok(())
    }

    pub fn backup_table(&self, name: &str, backup_name: &str) -> Result<()> {
        self.require_table(name)?;
        let sql = format!(
            "CREATE TABLE {} AS SELECT * FROM {}",
            quote_identifier(backup_name),
            quote_identifier(name)
        );
        self.conn.execute(&sql, [])?;
        info!("Backed up {} into {}", name, backup_name);
        Ok(())
    }

    pub fn database_info(&self) -> Result<DatabaseInfo> {
        let version: String = self.conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        let tables = self.list_tables()?;
        Ok(DatabaseInfo {
            kind: self.kind,
            database: self.database.clone(),
            version,
            table_count: tables.len(),
            tables,
        })
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| {
            error!("Failed to close connection: {}", e);
            AppError::Connection(e.to_string())
        })?;
        info!("Closed connection to {}", self.database);
        Ok(())
    }
}
