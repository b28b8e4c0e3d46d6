//! Heuristic statement splitting for migration files.
//!
//! The stateless HTTP backend runs exactly one statement per request, so every
//! migration file is broken into statements before execution. This is a line
//! heuristic, not a SQL parser:
//!
//! - a statement ends at a line whose last non-blank character is `;`
//! - semicolons in the middle of a line never split
//! - lines inside a dollar-quoted body (`$$ ... $$`, `$fn$ ... $fn$`) never split
//! - psql include directives (`\i`, `\ir`, `\include`, `\include_relative`) are dropped
//! - fragments that are blank or only `--` comments are dropped

use std::sync::LazyLock;

use regex::Regex;

static DOLLAR_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)?\$").unwrap());

const INCLUDE_DIRECTIVES: &[&str] = &["\\i", "\\ir", "\\include", "\\include_relative"];

/// Whether a line is a psql client-side include directive.
pub fn is_include_directive(line: &str) -> bool {
    let trimmed = line.trim_start();
    let Some(word) = trimmed.split_whitespace().next() else {
        return false;
    };
    INCLUDE_DIRECTIVES.contains(&word)
}

/// Split a migration file into independently executable statements, in file order.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut open_tag: Option<String> = None;

    for line in sql.lines() {
        if open_tag.is_none() && is_include_directive(line) {
            tracing::debug!(line = %line.trim(), "Dropping client-side include directive");
            continue;
        }

        open_tag = track_dollar_quotes(line, open_tag);

        current.push_str(line);
        current.push('\n');

        if open_tag.is_none() && line.trim_end().ends_with(';') {
            push_fragment(&mut statements, &current);
            current.clear();
        }
    }

    push_fragment(&mut statements, &current);
    statements
}

/// Advance the dollar-quote state across one line.
///
/// Returns the tag that is still open at the end of the line, if any. Outside
/// a body, `'...'` literals and `--` comments cannot open a tag; inside one,
/// only the matching closing tag matters.
fn track_dollar_quotes(line: &str, mut open_tag: Option<String>) -> Option<String> {
    let bytes = line.as_bytes();
    let mut pos = 0;
    let mut in_literal = false;

    while pos < bytes.len() {
        if let Some(open) = &open_tag {
            match line[pos..].find(open.as_str()) {
                Some(at) => {
                    pos += at + open.len();
                    open_tag = None;
                }
                None => break,
            }
            continue;
        }

        // A doubled '' closes and reopens, which nets out to an escaped quote.
        if in_literal {
            in_literal = bytes[pos] != b'\'';
            pos += 1;
            continue;
        }

        match bytes[pos] {
            b'\'' => {
                in_literal = true;
                pos += 1;
            }
            b'-' if bytes.get(pos + 1) == Some(&b'-') => break,
            b'$' => match DOLLAR_TAG_RE.find(&line[pos..]) {
                Some(m) if m.start() == 0 => {
                    open_tag = Some(m.as_str().to_string());
                    pos += m.end();
                }
                _ => pos += 1,
            },
            _ => pos += 1,
        }
    }
    open_tag
}

fn push_fragment(statements: &mut Vec<String>, fragment: &str) {
    let trimmed = fragment.trim();
    let has_sql = trimmed
        .lines()
        .filter(|l| !l.trim_start().starts_with("--"))
        .any(|l| l.chars().any(|c| !c.is_whitespace() && c != ';'));
    if has_sql {
        statements.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_end_of_line_semicolons() {
        let sql = "CREATE EXTENSION IF NOT EXISTS pgcrypto;\n\nCREATE TABLE users (\n  id uuid PRIMARY KEY\n);\n";
        let statements = split_statements(sql);
        assert_eq!(
            statements,
            vec![
                "CREATE EXTENSION IF NOT EXISTS pgcrypto;",
                "CREATE TABLE users (\n  id uuid PRIMARY KEY\n);",
            ]
        );
    }

    #[test]
    fn test_mid_line_semicolon_does_not_split() {
        let sql = "INSERT INTO notes (body) VALUES ('a; b');\nSELECT 1;";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO notes (body) VALUES ('a; b');");
    }

    #[test]
    fn test_two_statements_on_one_line_stay_together() {
        let statements = split_statements("SELECT 1; SELECT 2;\n");
        assert_eq!(statements, vec!["SELECT 1; SELECT 2;"]);
    }

    #[test]
    fn test_include_directives_are_dropped() {
        let sql = "\\i shared/functions.sql\nCREATE TABLE a (id int);\n  \\ir ./more.sql\n\\include_relative x.sql\n";
        let statements = split_statements(sql);
        assert_eq!(statements, vec!["CREATE TABLE a (id int);"]);
        assert!(statements.iter().all(|s| !s.contains("\\i")));
    }

    #[test]
    fn test_is_include_directive() {
        assert!(is_include_directive("\\i file.sql"));
        assert!(is_include_directive("   \\ir ../x.sql"));
        assert!(is_include_directive("\\include a.sql"));
        assert!(!is_include_directive("\\d users"));
        assert!(!is_include_directive("SELECT '\\i';"));
        assert!(!is_include_directive(""));
    }

    #[test]
    fn test_empty_and_comment_only_fragments_are_discarded() {
        let sql = "-- header comment\n\n;\n   \nCREATE TABLE b (id int);\n-- trailing note\n";
        let statements = split_statements(sql);
        assert_eq!(statements, vec!["CREATE TABLE b (id int);"]);
    }

    #[test]
    fn test_leading_comment_kept_with_statement() {
        let sql = "-- users\nCREATE TABLE users (id int);\n";
        let statements = split_statements(sql);
        assert_eq!(statements, vec!["-- users\nCREATE TABLE users (id int);"]);
    }

    #[test]
    fn test_unterminated_trailing_statement_is_kept() {
        let statements = split_statements("SELECT 1;\nSELECT 2");
        assert_eq!(statements, vec!["SELECT 1;", "SELECT 2"]);
    }

    #[test]
    fn test_dollar_quoted_body_is_not_split() {
        let sql = "\
CREATE OR REPLACE FUNCTION touch_updated_at() RETURNS trigger AS $$
BEGIN
  NEW.updated_at = now();
  RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE TABLE c (id int);
";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE OR REPLACE FUNCTION"));
        assert!(statements[0].ends_with("$$ LANGUAGE plpgsql;"));
        assert_eq!(statements[1], "CREATE TABLE c (id int);");
    }

    #[test]
    fn test_named_dollar_tags() {
        let sql = "DO $body$\nBEGIN\n  PERFORM 1;\n  RAISE NOTICE '$$';\nEND\n$body$;\nSELECT 1;\n";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("$body$;"));
    }

    #[test]
    fn test_dollar_sign_in_comment_ignored() {
        let sql = "-- costs $$ to run;\nSELECT 1;\nSELECT 2;\n";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_dollar_signs_in_string_literal_do_not_open_a_body() {
        let sql = "COMMENT ON TABLE users IS 'costs $$';\nCREATE TABLE a (id int);\n";
        let statements = split_statements(sql);
        assert_eq!(
            statements,
            vec!["COMMENT ON TABLE users IS 'costs $$';", "CREATE TABLE a (id int);"]
        );
    }

    #[test]
    fn test_escaped_quote_keeps_literal_open() {
        let sql = "INSERT INTO notes (body) VALUES ('it''s $tag$ here');\nSELECT 1;\n";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1], "SELECT 1;");
    }

    #[test]
    fn test_body_opens_after_literal_on_same_line() {
        let sql = "CREATE FUNCTION f() RETURNS text LANGUAGE sql AS $fn$\nSELECT 'x;';\n$fn$;\nSELECT 'a' || $$b$$;\nSELECT 2;\n";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 3);
        assert!(statements[0].ends_with("$fn$;"));
        assert_eq!(statements[1], "SELECT 'a' || $$b$$;");
    }

    #[test]
    fn test_crlf_input() {
        let statements = split_statements("SELECT 1;\r\nSELECT 2;\r\n");
        assert_eq!(statements, vec!["SELECT 1;", "SELECT 2;"]);
    }
}
