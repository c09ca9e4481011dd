use pest::iterators::Pair;
use pest::Parser;
use tracing::debug;

use crate::ast::{Placeholder, Segment, SmartSql};
use crate::error::ParseError;
use crate::grammar::{Rule, SoupqlParser};

/// Parse smart sql into text and placeholder segments.
/// Adjacent text (including quoted literals) is merged into a single segment.
pub fn parse_smart_sql(input: &str) -> Result<SmartSql, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::EmptyQuery);
    }

    let root = SoupqlParser::parse(Rule::SmartSql, input)?.next().ok_or(ParseError::EmptyQuery)?;
    if root.as_rule() != Rule::SmartSql {
        return Err(ParseError::UnexpectedRule { expected: "SmartSql", got: root.as_rule() });
    }

    let mut segments: Vec<Segment> = Vec::new();
    for pair in root.into_inner() {
        match pair.as_rule() {
            Rule::Text | Rule::QuotedString => push_text(&mut segments, pair.as_str()),
            Rule::Placeholder => segments.push(Segment::Placeholder(parse_placeholder(pair)?)),
            Rule::EOI => {}
            other => return Err(ParseError::UnexpectedRule { expected: "Text, QuotedString or Placeholder", got: other }),
        }
    }

    debug!("parse_smart_sql: {} segments from {:?}", segments.len(), input);
    Ok(SmartSql { segments })
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if let Some(Segment::Text(previous)) = segments.last_mut() {
        previous.push_str(text);
    } else {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn parse_placeholder(pair: Pair<Rule>) -> Result<Placeholder, ParseError> {
    let raw = pair.as_str().to_string();
    let mut inner = pair.into_inner();

    let soup = inner.next().ok_or_else(|| ParseError::InvalidPlaceholder(raw.clone()))?;
    if soup.as_rule() != Rule::SoupName {
        return Err(ParseError::UnexpectedRule { expected: "SoupName", got: soup.as_rule() });
    }
    let soup = soup.as_str().trim();
    if soup.is_empty() {
        return Err(ParseError::InvalidPlaceholder(raw));
    }

    let path = match inner.next() {
        Some(path) if path.as_rule() == Rule::Path => {
            let path = path.as_str().trim();
            if path.is_empty() {
                return Err(ParseError::InvalidPlaceholder(raw));
            }
            Some(path.to_string())
        }
        Some(other) => return Err(ParseError::UnexpectedRule { expected: "Path", got: other.as_rule() }),
        None => None,
    };

    Ok(Placeholder { soup: soup.to_string(), path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_sql_is_one_segment() {
        let sql = parse_smart_sql("select count(*) from sqlite_master").unwrap();
        assert_eq!(sql.segments, vec![Segment::Text("select count(*) from sqlite_master".into())]);
    }

    #[test]
    fn test_placeholders() {
        let sql = parse_smart_sql("select {employees:name}, {employees:_soup} from {employees} where {employees:age} > 40").unwrap();
        let placeholders: Vec<&Placeholder> = sql.placeholders().collect();
        assert_eq!(
            placeholders,
            vec![
                &Placeholder::column("employees", "name"),
                &Placeholder::column("employees", "_soup"),
                &Placeholder::table("employees"),
                &Placeholder::column("employees", "age"),
            ]
        );
        assert_eq!(sql.referenced_soups(), vec!["employees"]);
    }

    #[test]
    fn test_join_references_both_soups() {
        let sql =
            parse_smart_sql("select {e:name}, {d:title} from {e}, {d} where {e:deptCode} = {d:code} and {d:title} = 'it''s {x:y}'").unwrap();
        assert_eq!(sql.referenced_soups(), vec!["e", "d"]);
        // the quoted placeholder is not a reference
        assert!(sql.placeholders().all(|p| p.soup != "x"));
    }

    #[test]
    fn test_whitespace_inside_placeholder_is_trimmed() {
        let sql = parse_smart_sql("select { e : address.city } from { e }").unwrap();
        let placeholders: Vec<&Placeholder> = sql.placeholders().collect();
        assert_eq!(placeholders, vec![&Placeholder::column("e", "address.city"), &Placeholder::table("e")]);
    }

    #[test]
    fn test_render_substitutes() {
        let sql = parse_smart_sql("select {e:name} from {e} where {e:name} like 'A%'").unwrap();
        let rendered: Result<String, ParseError> = sql.render(|p| {
            Ok(match &p.path {
                Some(path) => format!("\"TABLE_1_{}\"", path),
                None => "\"TABLE_1\"".to_string(),
            })
        });
        assert_eq!(rendered.unwrap(), r#"select "TABLE_1_name" from "TABLE_1" where "TABLE_1_name" like 'A%'"#);
    }

    #[test]
    fn test_render_propagates_resolver_error() {
        let sql = parse_smart_sql("select {missing:x} from {missing}").unwrap();
        let rendered: Result<String, String> = sql.render(|p| Err(format!("unknown soup {}", p.soup)));
        assert_eq!(rendered.unwrap_err(), "unknown soup missing");
    }

    #[test]
    fn test_display_round_trips_source() {
        let source = "select {e:name} from {e} where x = '{not:me}'";
        assert_eq!(parse_smart_sql(source).unwrap().to_string(), source);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(parse_smart_sql("   "), Err(ParseError::EmptyQuery)));
        assert!(matches!(parse_smart_sql("select {e:name from {e}"), Err(ParseError::SyntaxError(_))));
        assert!(matches!(parse_smart_sql("select 'unterminated"), Err(ParseError::SyntaxError(_))));
    }
}
