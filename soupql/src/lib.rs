//! Smart SQL for soupstore
//!
//! Smart sql is plain SQL in which tables and columns are named through soup placeholders
//! instead of their physical identifiers:
//!
//! - `{soupName}` resolves to the soup's backing table
//! - `{soupName:path}` resolves to the column holding the indexed value of `path`
//! - `{soupName:_soup}`, `{soupName:_soupEntryId}` and `{soupName:_soupLastModifiedDate}`
//!   resolve to the payload, identifier and last-modified columns
//!
//! This crate only parses and renders; resolving placeholders against a catalog is
//! up to the caller (see `SmartSql::render`).
//!
//! ```rust,ignore
//! let sql = soupql::parse_smart_sql("select {employees:name} from {employees}")?;
//! let rendered = sql.render(|placeholder| resolve(placeholder))?;
//! ```

pub mod ast;
pub mod error;
pub mod grammar;
pub mod parser;

pub use ast::{Placeholder, Segment, SmartSql};
pub use error::ParseError;
pub use parser::parse_smart_sql;
