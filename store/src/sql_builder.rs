//! Query translator
//!
//! Turns a [`QuerySpec`] into the SQL that selects a page of results, counts them, or lists
//! the matching entry ids. Results are always ordered, with the entry id as the final tie-break.

use rusqlite::types::Value as SqlValue;
use soupql::{Placeholder, SmartSql};

use crate::catalog::SoupMetadata;
use crate::error::{Result, SoupStoreError};
use crate::path::query_key;
use crate::query::{OrderDirection, QueryKind, QuerySpec};
use crate::spec::{IndexType, SOUP_CREATED_DATE, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE, SOUP_PAYLOAD};
use crate::table::{fts_table_name, CREATED_COL, ID_COL, LAST_MODIFIED_COL, SOUP_COL};
use crate::value::SqliteValue;

/// Double-quote an identifier
pub fn quote_ident(name: &str) -> String { format!(r#""{}""#, name.replace('"', "\"\"")) }

/// Shape of a translated query's rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// `(id, soup)` pairs decoded into documents
    Entries { table: String, external: bool },
    /// Arbitrary rows from a smart query
    Rows,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedQuery {
    /// Every result, ordered, without paging
    pub select_sql: String,
    /// `select_sql` with trailing `LIMIT ? OFFSET ?`
    pub page_sql: String,
    pub count_sql: String,
    /// Single column of matching entry ids, for bulk deletes
    pub ids_sql: String,
    pub params: Vec<SqlValue>,
    pub projection: Projection,
}

impl TranslatedQuery {
    pub fn page_params(&self, page_index: usize, page_size: usize) -> Vec<SqlValue> {
        let mut params = self.params.clone();
        params.push(SqlValue::Integer(page_size as i64));
        params.push(SqlValue::Integer(page_index.saturating_mul(page_size) as i64));
        params
    }
}

/// Accumulates SQL text with positional parameters
#[derive(Debug, Default)]
pub struct SqlBuilder {
    sql: String,
    params: Vec<SqlValue>,
}

impl SqlBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn push_sql(&mut self, s: &str) { self.sql.push_str(s); }

    pub fn push_param(&mut self, value: SqlValue) {
        self.sql.push('?');
        self.params.push(value);
    }

    pub fn is_empty(&self) -> bool { self.sql.is_empty() }

    pub fn build(self) -> (String, Vec<SqlValue>) { (self.sql, self.params) }
}

/// Translate a structured (non-smart) query against one soup
pub fn translate(spec: &QuerySpec, meta: &SoupMetadata) -> Result<TranslatedQuery> {
    let table = quote_ident(&meta.table_name);
    let mut predicate = SqlBuilder::new();

    match &spec.kind {
        QueryKind::All => {}
        QueryKind::Exact { path, key } => {
            let column = meta.require_column(path)?;
            predicate.push_sql(&column.expression(None));
            match query_key(column.index_type, key) {
                SqliteValue::Null => predicate.push_sql(" IS NULL"),
                key => {
                    predicate.push_sql(" = ");
                    predicate.push_param(key.to_sql());
                }
            }
        }
        QueryKind::Range { path, begin, end } => {
            let column = meta.require_column(path)?;
            let expression = column.expression(None);
            let bounds = [(begin, " >= "), (end, " <= ")];
            for (bound, operator) in bounds {
                let Some(bound) = bound else { continue };
                if !predicate.is_empty() {
                    predicate.push_sql(" AND ");
                }
                predicate.push_sql(&expression);
                predicate.push_sql(operator);
                predicate.push_param(query_key(column.index_type, bound).to_sql());
            }
        }
        QueryKind::Like { path, pattern } => {
            let column = meta.require_column(path)?;
            predicate.push_sql(&column.expression(None));
            predicate.push_sql(" LIKE ");
            predicate.push_param(SqlValue::Text(pattern.clone()));
        }
        QueryKind::Match { path, query } => {
            let fts = quote_ident(&fts_table_name(&meta.table_name));
            let match_expr = match path {
                Some(path) => {
                    let column = meta.require_column(path)?;
                    if column.index_type != IndexType::FullText {
                        return Err(SoupStoreError::InvalidSpec(format!("match query on {} which is a {} index", path, column.index_type)));
                    }
                    // FTS5 column filter
                    format!("{{{}}} : ({})", column.column_name, query)
                }
                None => {
                    if meta.full_text_columns().is_empty() {
                        return Err(SoupStoreError::InvalidSpec(format!("soup {} has no full_text index", meta.name())));
                    }
                    query.clone()
                }
            };
            predicate.push_sql(&format!("{} IN (SELECT rowid FROM {} WHERE {} MATCH ", quote_ident(ID_COL), fts, fts));
            predicate.push_param(SqlValue::Text(match_expr));
            predicate.push_sql(")");
        }
        QueryKind::Smart { .. } => return Err(SoupStoreError::InvalidSpec("smart queries are translated with translate_smart".to_string())),
    }

    let mut order = String::from(" ORDER BY ");
    if let Some(order_path) = &spec.order_path {
        let column = meta.require_column(order_path)?;
        order.push_str(&format!("{} {}, ", column.expression(None), spec.order.as_sql()));
    }
    order.push_str(&format!("{} {}", quote_ident(ID_COL), OrderDirection::Ascending.as_sql()));

    let (predicate, params) = predicate.build();
    let where_clause = if predicate.is_empty() { String::new() } else { format!(" WHERE {}", predicate) };

    let select_sql = format!("SELECT {}, {} FROM {}{}{}", quote_ident(ID_COL), quote_ident(SOUP_COL), table, where_clause, order);
    Ok(TranslatedQuery {
        page_sql: format!("{} LIMIT ? OFFSET ?", select_sql),
        count_sql: format!("SELECT count(*) FROM {}{}", table, where_clause),
        ids_sql: format!("SELECT {} FROM {}{}", quote_ident(ID_COL), table, where_clause),
        select_sql,
        params,
        projection: Projection::Entries { table: meta.table_name.clone(), external: meta.uses_external_storage() },
    })
}

/// Translate a parsed smart query. `resolve` supplies catalog entries for the soups it names.
pub fn translate_smart<F>(smart: &SmartSql, mut resolve: F) -> Result<TranslatedQuery>
where F: FnMut(&str) -> Result<SoupMetadata> {
    let rendered = smart.render(|placeholder| {
        let meta = resolve(&placeholder.soup)?;
        resolve_placeholder(&meta, placeholder)
    })?;
    Ok(smart_query(&rendered))
}

/// Wrap already rendered smart SQL for paging and counting
pub fn smart_query(rendered: &str) -> TranslatedQuery {
    let sql = rendered.trim().trim_end_matches(';').trim_end().to_string();
    TranslatedQuery {
        page_sql: format!("SELECT * FROM ({}) LIMIT ? OFFSET ?", sql),
        count_sql: format!("SELECT count(*) FROM ({})", sql),
        ids_sql: sql.clone(),
        select_sql: sql,
        params: Vec::new(),
        projection: Projection::Rows,
    }
}

fn resolve_placeholder(meta: &SoupMetadata, placeholder: &Placeholder) -> Result<String> {
    let table = &meta.table_name;
    let qualified = |column: &str| format!("{}.{}", quote_ident(table), quote_ident(column));
    let Some(path) = placeholder.path.as_deref() else {
        return Ok(quote_ident(table));
    };
    match path {
        SOUP_PAYLOAD if meta.uses_external_storage() => {
            Err(SoupStoreError::InvalidSpec(format!("soup {} keeps its payloads in external storage, {} is not selectable", meta.name(), SOUP_PAYLOAD)))
        }
        SOUP_PAYLOAD => Ok(qualified(SOUP_COL)),
        SOUP_ENTRY_ID => Ok(qualified(ID_COL)),
        SOUP_LAST_MODIFIED_DATE => Ok(qualified(LAST_MODIFIED_COL)),
        SOUP_CREATED_DATE => Ok(qualified(CREATED_COL)),
        path => Ok(meta.require_column(path)?.expression(Some(table))),
    }
}
