use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed smart sql statement: raw sql text interleaved with soup placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartSql {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// Sql text passed through untouched (string literals included)
    Text(String),
    Placeholder(Placeholder),
}

/// `{soup}` refers to the soup's table, `{soup:path}` to one of its columns
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placeholder {
    pub soup: String,
    pub path: Option<String>,
}

impl Placeholder {
    pub fn table(soup: impl Into<String>) -> Self { Self { soup: soup.into(), path: None } }

    pub fn column(soup: impl Into<String>, path: impl Into<String>) -> Self { Self { soup: soup.into(), path: Some(path.into()) } }
}

impl SmartSql {
    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(p) => Some(p),
            Segment::Text(_) => None,
        })
    }

    /// Soup names referenced by the statement, in first-seen order
    pub fn referenced_soups(&self) -> Vec<&str> {
        let mut soups: Vec<&str> = Vec::new();
        for placeholder in self.placeholders() {
            if !soups.contains(&placeholder.soup.as_str()) {
                soups.push(&placeholder.soup);
            }
        }
        soups
    }

    /// Substitute every placeholder with whatever the resolver returns for it.
    pub fn render<F, E>(&self, mut resolve: F) -> Result<String, E>
    where F: FnMut(&Placeholder) -> Result<String, E> {
        let mut sql = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Placeholder(placeholder) => sql.push_str(&resolve(placeholder)?),
            }
        }
        Ok(sql)
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{{{}:{}}}", self.soup, path),
            None => write!(f, "{{{}}}", self.soup),
        }
    }
}

impl fmt::Display for SmartSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => f.write_str(text)?,
                Segment::Placeholder(placeholder) => write!(f, "{}", placeholder)?,
            }
        }
        Ok(())
    }
}
