//! View translation.
//!
//! MySQL stores view definitions fully qualified (`` `shop`.`users`.`id` ``).
//! Qualified table references are mapped to their target tables, remaining
//! backtick identifiers are case-folded and a few function spellings are
//! rewritten. Definitions that rely on MySQL-only syntax are skipped.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::warn;

use super::{cached_regex, NameIndex};
use crate::core::identifier::qualify_pg;
use crate::core::schema::ViewDescriptor;

const UNSUPPORTED: &[(&str, &str)] = &[
    (r"(?i)\blimit\s+\d+\s*,", "LIMIT offset,count"),
    (r"(?i)\bstraight_join\b", "STRAIGHT_JOIN"),
    (r"(?i)\bsql_[a-z_]+\b", "SQL_* hint"),
    (r"@@?[A-Za-z_]", "user or system variable"),
    (r"(?i)\bgroup_concat\s*\(", "GROUP_CONCAT"),
    (r"(?i)\bdate_format\s*\(", "DATE_FORMAT"),
];

fn unsupported_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        UNSUPPORTED
            .iter()
            .filter_map(|(pattern, what)| Regex::new(pattern).ok().map(|re| (re, *what)))
            .collect()
    })
}

/// First unsupported construct in a view definition, if any.
pub fn unsupported_construct(definition: &str) -> Option<&'static str> {
    // String literals may legitimately contain any of the patterns.
    let code = strip_string_literals(definition);
    unsupported_patterns()
        .iter()
        .find(|(re, _)| re.is_match(&code))
        .map(|(_, what)| *what)
}

/// Translate a view to `CREATE OR REPLACE VIEW`, or `None` (with a warning)
/// when it cannot be carried over.
pub fn translate_view(view: &ViewDescriptor, names: &NameIndex) -> Option<String> {
    static QUALIFIED: OnceLock<Option<Regex>> = OnceLock::new();
    static BACKTICK: OnceLock<Option<Regex>> = OnceLock::new();
    static IFNULL: OnceLock<Option<Regex>> = OnceLock::new();

    if let Some(what) = unsupported_construct(&view.definition) {
        warn!("Skipping view {}: uses {}", view.name, what);
        return None;
    }

    let target_schema = names.target_schema();
    let mut unresolved = None;

    // `db`.`table` -> "schema"."target"
    let mut body = view.definition.clone();
    if let Some(re) = cached_regex(&QUALIFIED, r"`((?:[^`]|``)+)`\s*\.\s*`((?:[^`]|``)+)`") {
        body = re
            .replace_all(&body, |caps: &Captures<'_>| {
                let db = caps[1].replace("``", "`");
                let table = caps[2].replace("``", "`");
                // `alias`.`column`, or a table in another database
                if !db.eq_ignore_ascii_case(&view.source_schema) {
                    return caps[0].to_string();
                }
                match names.table(&table) {
                    Some(target) => qualify_pg(target_schema, target).unwrap_or_default(),
                    None => {
                        unresolved.get_or_insert_with(|| table.clone());
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();
    }
    if let Some(table) = unresolved {
        warn!(
            "Skipping view {}: references {} which is not migrated",
            view.name, table
        );
        return None;
    }

    if let Some(re) = cached_regex(&BACKTICK, r"`((?:[^`]|``)+)`") {
        body = re
            .replace_all(&body, |caps: &Captures<'_>| {
                let name = names.fold(&caps[1].replace("``", "`"));
                format!("\"{}\"", name.replace('"', "\"\""))
            })
            .into_owned();
    }
    if let Some(re) = cached_regex(&IFNULL, r"(?i)\bifnull\s*\(") {
        body = re.replace_all(&body, "COALESCE(").into_owned();
    }

    let name = match qualify_pg(target_schema, &names.fold(&view.name)) {
        Ok(name) => name,
        Err(e) => {
            warn!("Skipping view {}: {}", view.name, e);
            return None;
        }
    };
    Some(format!("CREATE OR REPLACE VIEW {} AS {}", name, body.trim()))
}

/// Replace the contents of single-quoted literals with spaces.
fn strip_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_quote = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quote {
            if c == '\\' {
                chars.next();
                out.push_str("  ");
                continue;
            }
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push_str("  ");
                    continue;
                }
                in_quote = false;
                out.push(c);
                continue;
            }
            out.push(' ');
        } else {
            if c == '\'' {
                in_quote = true;
            }
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentifierCase;
    use crate::core::schema::tests::{make_column, make_table};

    fn names() -> NameIndex {
        let mut users = make_table("Users", vec![make_column("ID", "int", 1)]);
        users.target_name = "people".into();
        let orders = make_table("orders", vec![make_column("id", "int", 1)]);
        NameIndex::new([&users, &orders], IdentifierCase::Lower)
    }

    fn view(definition: &str) -> ViewDescriptor {
        ViewDescriptor {
            source_schema: "shop".into(),
            name: "Active_Users".into(),
            definition: definition.into(),
        }
    }

    #[test]
    fn test_translate_simple_view() {
        let sql = translate_view(
            &view("select `shop`.`Users`.`ID` AS `ID`,ifnull(`shop`.`Users`.`ID`,0) AS `n` from `shop`.`Users`"),
            &names(),
        )
        .unwrap();
        assert_eq!(
            sql,
            "CREATE OR REPLACE VIEW \"public\".\"active_users\" AS select \"public\".\"people\".\"id\" AS \"id\",COALESCE(\"public\".\"people\".\"id\",0) AS \"n\" from \"public\".\"people\""
        );
    }

    #[test]
    fn test_unsupported_constructs_skipped() {
        for def in [
            "select * from `shop`.`orders` limit 10, 20",
            "select straight_join * from `shop`.`orders`",
            "select sql_no_cache * from `shop`.`orders`",
            "select @row := 1 from `shop`.`orders`",
            "select group_concat(`id`) from `shop`.`orders`",
            "select date_format(now(), '%Y') from `shop`.`orders`",
        ] {
            assert!(translate_view(&view(def), &names()).is_none(), "{}", def);
        }
    }

    #[test]
    fn test_literals_do_not_trigger_rejection() {
        assert_eq!(
            unsupported_construct("select 'user@example.com' AS `email`"),
            None
        );
        assert_eq!(
            unsupported_construct("select 'it''s group_concat(' AS `x`"),
            None
        );
    }

    #[test]
    fn test_unknown_table_skipped() {
        assert!(translate_view(&view("select * from `shop`.`audit`"), &names()).is_none());
    }

    #[test]
    fn test_alias_references_kept() {
        let sql = translate_view(
            &view("select `o`.`id` AS `id` from `shop`.`orders` `o`"),
            &names(),
        )
        .unwrap();
        assert!(sql.ends_with("select \"o\".\"id\" AS \"id\" from \"public\".\"orders\" \"o\""));
    }
}
