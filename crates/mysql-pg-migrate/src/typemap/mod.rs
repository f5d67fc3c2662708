//! Type mapping between MySQL and PostgreSQL.
//!
//! The map is data, not code: a YAML document of entries keyed by a literal
//! declaration (`tinyint(1)`) or a base type name (`varchar`), embedded in
//! the binary and optionally merged with an operator file. Resolution is a
//! pure function over the loaded map.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{MigrationConfig, TypeMapMode};
use crate::error::{MigrateError, Result};

const BUILTIN_MAP: &str = include_str!("default_map.yaml");

/// One mapping rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMapEntry {
    /// Literal declaration or base type name.
    pub source: String,
    /// Target type template.
    pub target: String,
    /// Target used when the declaration has no parameters.
    #[serde(default)]
    pub bare: Option<String>,
    /// Largest `{size}` the target template accepts.
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Target used when `{size}` exceeds `max_size`.
    #[serde(default)]
    pub oversize: Option<String>,
    /// Target used for `unsigned` declarations.
    #[serde(default)]
    pub unsigned: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TypeMapFile {
    #[serde(default)]
    types: Vec<TypeMapEntry>,
    #[serde(default)]
    default: Option<String>,
}

/// A MySQL column declaration split into its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedType {
    /// Lower-cased base name, e.g. `varchar`.
    pub base: String,
    /// Parameters with quotes kept, e.g. `["255"]` or `["'a'", "'b'"]`.
    pub args: Vec<String>,
    pub unsigned: bool,
    /// Canonical spelling used for literal lookups, e.g. `int(10) unsigned`.
    pub normalized: String,
}

impl ParsedType {
    /// Canonical spelling without the sign attribute.
    pub fn signless(&self) -> String {
        if self.args.is_empty() {
            self.base.clone()
        } else {
            format!("{}({})", self.base, self.args.join(","))
        }
    }

    /// Labels of an `enum(...)`/`set(...)` declaration with quotes removed.
    pub fn labels(&self) -> Vec<String> {
        self.args.iter().map(|a| unquote(a)).collect()
    }

    fn size(&self, source_type: &str) -> Result<Option<u64>> {
        match self.args.first() {
            None => Ok(None),
            Some(arg) => arg.parse::<u64>().map(Some).map_err(|_| {
                MigrateError::schema_parse(
                    "",
                    format!("non-numeric size '{}' in '{}'", arg, source_type),
                )
            }),
        }
    }
}

/// Parse a declared column type such as `decimal(10, 2) unsigned zerofill`.
///
/// Lower-cases everything outside quotes, collapses whitespace and drops
/// `zerofill`. Unbalanced parentheses or quotes raise `SchemaParse`.
pub fn parse_declaration(source_type: &str) -> Result<ParsedType> {
    let malformed =
        |why: &str| MigrateError::schema_parse("", format!("{} in type '{}'", why, source_type));

    let trimmed = source_type.trim();
    let (head, args, tail) = match trimmed.find('(') {
        Some(open) => {
            let close = find_closing_paren(trimmed, open).ok_or_else(|| malformed("unbalanced parentheses"))?;
            let inner = &trimmed[open + 1..close];
            let args = split_args(inner).ok_or_else(|| malformed("unterminated quote"))?;
            (&trimmed[..open], args, &trimmed[close + 1..])
        }
        None => {
            if trimmed.contains(')') {
                return Err(malformed("unbalanced parentheses"));
            }
            // Base names never contain spaces in COLUMN_TYPE, so the first
            // word is the base and the rest are attributes.
            match trimmed.find(char::is_whitespace) {
                Some(sp) => (&trimmed[..sp], Vec::new(), &trimmed[sp..]),
                None => (trimmed, Vec::new(), ""),
            }
        }
    };

    let base = head.trim().to_lowercase();
    if base.is_empty() || base.contains(char::is_whitespace) {
        return Err(malformed("missing or invalid base type"));
    }

    let mut unsigned = false;
    for word in tail.split_whitespace() {
        match word.to_lowercase().as_str() {
            "unsigned" => unsigned = true,
            "signed" | "zerofill" => {}
            other => return Err(malformed(&format!("unexpected attribute '{}'", other))),
        }
    }

    let mut parsed = ParsedType {
        base,
        args,
        unsigned,
        normalized: String::new(),
    };
    parsed.normalized = if unsigned {
        format!("{} unsigned", parsed.signless())
    } else {
        parsed.signless()
    };
    Ok(parsed)
}

fn find_closing_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = s.char_indices().skip_while(|(i, _)| *i < open).peekable();
    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) if c == q => {
                // Doubled quote inside a label
                if chars.peek().map(|(_, n)| *n == q).unwrap_or(false) {
                    chars.next();
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// Split a parameter list on commas outside quotes; lower-case unquoted text.
fn split_args(inner: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    if chars.peek() == Some(&q) {
                        current.push(q);
                        chars.next();
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ',' => {
                    args.push(current.trim().to_string());
                    current.clear();
                }
                c if c.is_whitespace() => {}
                c => current.extend(c.to_lowercase()),
            },
        }
    }
    if quote.is_some() {
        return None;
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_string());
    }
    Some(args)
}

fn unquote(arg: &str) -> String {
    let bytes = arg.as_bytes();
    if bytes.len() >= 2 {
        let q = bytes[0];
        if (q == b'\'' || q == b'"') && bytes[bytes.len() - 1] == q {
            let q = q as char;
            let inner = &arg[1..arg.len() - 1];
            return inner.replace(&format!("{q}{q}"), &q.to_string());
        }
    }
    arg.to_string()
}

/// The loaded MySQL -> PostgreSQL type map.
#[derive(Debug, Clone, Default)]
pub struct TypeMap {
    literals: HashMap<String, TypeMapEntry>,
    bases: HashMap<String, TypeMapEntry>,
    default: Option<String>,
}

impl TypeMap {
    /// The embedded map.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_MAP)
    }

    /// Parse a map document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: TypeMapFile = serde_yaml::from_str(yaml)?;
        let mut map = TypeMap {
            default: file.default,
            ..Default::default()
        };
        for entry in file.types {
            map.insert(entry)?;
        }
        Ok(map)
    }

    /// Build the map a migration uses: the embedded map, combined with the
    /// operator file when one is configured.
    pub fn load(config: &MigrationConfig) -> Result<Self> {
        let builtin = Self::builtin()?;
        let Some(path) = &config.type_map_file else {
            return Ok(builtin);
        };

        let operator = Self::from_file(path)?;
        Ok(match config.type_map_mode {
            TypeMapMode::Merge => builtin.merge(operator),
            TypeMapMode::Replace => operator,
        })
    }

    /// Parse a map file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| {
            MigrateError::Config(format!("type map {}: {}", path.display(), e))
        })
    }

    /// Overlay `other` on this map; its entries and default win.
    pub fn merge(mut self, other: TypeMap) -> Self {
        self.literals.extend(other.literals);
        self.bases.extend(other.bases);
        if other.default.is_some() {
            self.default = other.default;
        }
        self
    }

    fn insert(&mut self, entry: TypeMapEntry) -> Result<()> {
        let parsed = parse_declaration(&entry.source).map_err(|e| {
            MigrateError::Config(format!("type map entry '{}': {}", entry.source, e))
        })?;
        if parsed.args.is_empty() && !parsed.unsigned {
            self.bases.insert(parsed.base, entry);
        } else {
            self.literals.insert(parsed.normalized, entry);
        }
        Ok(())
    }

    /// Number of entries (literal and base).
    pub fn len(&self) -> usize {
        self.literals.len() + self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.bases.is_empty() && self.default.is_none()
    }

    /// Resolve a declared MySQL column type to a PostgreSQL type expression.
    ///
    /// Lookup order: literal entry for the full declaration, literal entry
    /// without the sign attribute, base-name entry, map default. Fails with
    /// `UnmappedType` when none applies.
    pub fn resolve(&self, source_type: &str) -> Result<String> {
        let parsed = parse_declaration(source_type)?;

        let entry = self
            .literals
            .get(&parsed.normalized)
            .or_else(|| self.literals.get(&parsed.signless()))
            .or_else(|| self.bases.get(&parsed.base));

        let resolved = match entry {
            Some(entry) => render(entry, &parsed, source_type)?,
            None => match &self.default {
                Some(default) => substitute(default, &parsed, source_type)?,
                None => return Err(MigrateError::unmapped(source_type)),
            },
        };

        debug!("type {} -> {}", source_type, resolved);
        Ok(resolved)
    }
}

fn render(entry: &TypeMapEntry, parsed: &ParsedType, source_type: &str) -> Result<String> {
    if parsed.unsigned {
        if let Some(unsigned) = &entry.unsigned {
            return substitute(unsigned, parsed, source_type);
        }
    }
    if parsed.args.is_empty() {
        if let Some(bare) = &entry.bare {
            return Ok(bare.clone());
        }
    }
    if let Some(max) = entry.max_size {
        let size = parsed.size(source_type)?.unwrap_or(0);
        if size > max {
            if let Some(oversize) = &entry.oversize {
                return Ok(oversize.clone());
            }
        }
    }
    substitute(&entry.target, parsed, source_type)
}

fn substitute(template: &str, parsed: &ParsedType, source_type: &str) -> Result<String> {
    if !template.contains('{') {
        return Ok(template.to_string());
    }

    let missing = |name: &str| {
        MigrateError::schema_parse(
            "",
            format!("type '{}' has no {} for '{}'", source_type, name, template),
        )
    };

    let mut out = template.to_string();
    if out.contains("{size}") || out.contains("{precision}") {
        let size = parsed.size(source_type)?.ok_or_else(|| missing("size"))?;
        out = out
            .replace("{size}", &size.to_string())
            .replace("{precision}", &size.to_string());
    }
    if out.contains("{scale}") {
        let scale = match parsed.args.get(1) {
            Some(arg) => arg.parse::<u64>().map_err(|_| missing("numeric scale"))?,
            None => 0,
        };
        out = out.replace("{scale}", &scale.to_string());
    }
    if out.contains("{args}") {
        out = out.replace("{args}", &parsed.args.join(","));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> TypeMap {
        TypeMap::builtin().unwrap()
    }

    #[test]
    fn test_integer_types() {
        let map = builtin();
        assert_eq!(map.resolve("int(11)").unwrap(), "integer");
        assert_eq!(map.resolve("int(10) unsigned").unwrap(), "bigint");
        assert_eq!(map.resolve("bigint(20) unsigned").unwrap(), "numeric(20)");
        assert_eq!(map.resolve("tinyint(4)").unwrap(), "smallint");
        assert_eq!(map.resolve("mediumint(8) unsigned zerofill").unwrap(), "integer");
    }

    #[test]
    fn test_literal_beats_base() {
        let map = builtin();
        assert_eq!(map.resolve("tinyint(1)").unwrap(), "boolean");
        assert_eq!(map.resolve("TINYINT(1) UNSIGNED").unwrap(), "boolean");
        assert_eq!(map.resolve("bit(1)").unwrap(), "boolean");
        assert_eq!(map.resolve("bit(8)").unwrap(), "bit varying(8)");
    }

    #[test]
    fn test_sized_types() {
        let map = builtin();
        assert_eq!(map.resolve("varchar(50)").unwrap(), "character varying(50)");
        assert_eq!(map.resolve("varchar(20000000)").unwrap(), "text");
        assert_eq!(map.resolve("char(3)").unwrap(), "character(3)");
        assert_eq!(map.resolve("decimal(10, 2)").unwrap(), "numeric(10,2)");
        assert_eq!(map.resolve("decimal").unwrap(), "numeric");
        assert_eq!(map.resolve("datetime(6)").unwrap(), "timestamp(6)");
        assert_eq!(map.resolve("datetime").unwrap(), "timestamp");
    }

    #[test]
    fn test_other_types() {
        let map = builtin();
        assert_eq!(map.resolve("text").unwrap(), "text");
        assert_eq!(map.resolve("longblob").unwrap(), "bytea");
        assert_eq!(map.resolve("json").unwrap(), "jsonb");
        assert_eq!(map.resolve("enum('a','b')").unwrap(), "text");
        assert_eq!(map.resolve("year(4)").unwrap(), "smallint");
        assert_eq!(map.resolve("point").unwrap(), "text");
    }

    #[test]
    fn test_unmapped_without_default() {
        let map = TypeMap::from_yaml("types:\n  - source: int\n    target: integer\n").unwrap();
        let err = map.resolve("enum('a','b')").unwrap_err();
        assert!(matches!(err, MigrateError::UnmappedType { .. }));
        assert!(builtin().resolve("mystery").is_err());
    }

    #[test]
    fn test_default_applies_last() {
        let map = TypeMap::from_yaml("types: []\ndefault: text\n").unwrap();
        assert_eq!(map.resolve("enum('a','b')").unwrap(), "text");
    }

    #[test]
    fn test_merge_overrides_builtin() {
        let operator = TypeMap::from_yaml(
            "types:\n  - source: tinyint(1)\n    target: smallint\n  - source: json\n    target: json\n",
        )
        .unwrap();
        let map = builtin().merge(operator);
        assert_eq!(map.resolve("tinyint(1)").unwrap(), "smallint");
        assert_eq!(map.resolve("json").unwrap(), "json");
        assert_eq!(map.resolve("int").unwrap(), "integer");
    }

    #[test]
    fn test_load_replace_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.yaml");
        std::fs::write(&path, "types:\n  - source: int\n    target: bigint\n").unwrap();

        let config = MigrationConfig {
            type_map_file: Some(path),
            type_map_mode: TypeMapMode::Replace,
            ..Default::default()
        };
        let map = TypeMap::load(&config).unwrap();
        assert_eq!(map.resolve("int(11)").unwrap(), "bigint");
        assert!(map.resolve("varchar(10)").is_err());
    }

    #[test]
    fn test_malformed_declarations() {
        let map = builtin();
        for bad in ["varchar(10", "enum('a", "int)", "varchar(abc)", "int(11) frobnicate", ""] {
            let err = map.resolve(bad).unwrap_err();
            assert!(
                matches!(err, MigrateError::SchemaParse { .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn test_parse_declaration_keeps_label_case() {
        let parsed = parse_declaration("ENUM('Draft', 'It''s live')").unwrap();
        assert_eq!(parsed.base, "enum");
        assert_eq!(parsed.labels(), vec!["Draft", "It's live"]);
        assert_eq!(parsed.normalized, "enum('Draft','It''s live')");
    }
}
