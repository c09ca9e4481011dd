use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "soupql.pest"]
pub struct SoupqlParser;

#[cfg(test)]
mod tests {
    use super::*;
    use pest::*;

    #[test]
    fn test_table_placeholder() {
        parses_to! {
            parser: SoupqlParser,
            input: "{employees}",
            rule: Rule::SmartSql,
            tokens: [
                SmartSql(0, 11, [
                    Placeholder(0, 11, [SoupName(1, 10)]),
                    EOI(11, 11)
                ])
            ]
        };
    }

    #[test]
    fn test_column_placeholder() {
        parses_to! {
            parser: SoupqlParser,
            input: "{e:name}",
            rule: Rule::SmartSql,
            tokens: [
                SmartSql(0, 8, [
                    Placeholder(0, 8, [SoupName(1, 2), Path(3, 7)]),
                    EOI(8, 8)
                ])
            ]
        };
    }

    #[test]
    fn test_placeholder_inside_literal_is_text() {
        let pairs = SoupqlParser::parse(Rule::SmartSql, "select 1 where x = '{e:name}'").unwrap();
        let rules: Vec<Rule> = pairs.flatten().map(|p| p.as_rule()).collect();
        assert!(!rules.contains(&Rule::Placeholder));
        assert!(rules.contains(&Rule::QuotedString));
    }

    #[test]
    fn test_unterminated_placeholder_fails() {
        assert!(SoupqlParser::parse(Rule::SmartSql, "select {e:name from x").is_err());
        assert!(SoupqlParser::parse(Rule::SmartSql, "select {} from x").is_err());
    }
}
