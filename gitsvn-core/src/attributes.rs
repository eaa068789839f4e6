//! Property rules derived from `.gitattributes`
//!
//! Each directory may hold a rule file. Its rules apply to every path below
//! that directory. Rules are folded outer to inner, so a deeper rule file (or
//! a later line of the same file) wins when two rules set the same property.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::object::{ObjectKind, TreeEntry};
use crate::path;
use crate::storage::ObjectStore;

/// Name of the per-directory rule file
pub const ATTRIBUTES_FILE: &str = ".gitattributes";

/// Rule files the derived properties must stay consistent with
pub const CONFIG_FILES: &[&str] = &[ATTRIBUTES_FILE];

/// A path's property set, name → value
pub type Properties = BTreeMap<String, String>;

/// Subversion property names and well-known values
pub mod svn_props {
    pub const MIME_TYPE: &str = "svn:mime-type";
    pub const EOL_STYLE: &str = "svn:eol-style";
    pub const EXECUTABLE: &str = "svn:executable";
    pub const SPECIAL: &str = "svn:special";
    pub const AUTO_PROPS: &str = "svn:auto-props";

    pub const BINARY_MIME_TYPE: &str = "application/octet-stream";
    pub const EOL_STYLE_LF: &str = "LF";
    pub const EOL_STYLE_NATIVE: &str = "native";
    pub const EOL_STYLE_CR: &str = "CR";
    pub const EOL_STYLE_CRLF: &str = "CRLF";
}

const EOL_PREFIX: &str = "eol=";
const FILTER_PREFIX: &str = "filter=";

/// A gitattributes path pattern compiled to a regex.
///
/// A pattern without `/` matches the file name at any depth below the rule
/// file. A pattern containing `/` is matched against the path relative to the
/// directory holding the rule file.
#[derive(Debug, Clone)]
pub struct Wildcard {
    pattern: String,
    anchored: bool,
    dir_only: bool,
    regex: Regex,
}

impl Wildcard {
    pub fn new(pattern: &str) -> std::result::Result<Self, String> {
        let mut body = pattern;
        let dir_only = body.len() > 1 && body.ends_with('/');
        if dir_only {
            body = &body[..body.len() - 1];
        }
        let anchored = body.contains('/');
        let body = body.strip_prefix('/').unwrap_or(body);
        if body.is_empty() {
            return Err(format!("empty pattern: {:?}", pattern));
        }

        let regex = Regex::new(&format!("^{}$", translate(body)?))
            .map_err(|e| format!("{}: {}", pattern, e))?;
        Ok(Self {
            pattern: pattern.to_string(),
            anchored,
            dir_only,
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether Subversion can use the pattern as an auto-props key
    pub fn is_svn_compatible(&self) -> bool {
        !self.anchored && !self.dir_only && !self.pattern.contains("**")
    }

    /// Match a path given relative to the rule file's directory
    pub fn matches(&self, relative: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.anchored {
            self.regex.is_match(relative)
        } else {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            self.regex.is_match(name)
        }
    }
}

fn translate(pattern: &str) -> std::result::Result<String, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let at_segment_start = i == 0 || chars[i - 1] == '/';
                if at_segment_start && chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .enumerate()
                    .skip(1)
                    .find(|(_, c)| **c == ']')
                    .map(|(offset, _)| i + 1 + offset)
                    .ok_or_else(|| format!("unterminated character class in {:?}", pattern))?;
                out.push('[');
                let mut class = &chars[i + 1..close];
                if let Some('!') | Some('^') = class.first() {
                    out.push('^');
                    class = &class[1..];
                }
                for c in class {
                    if matches!(c, '\\' | '[' | '&' | '~') {
                        out.push('\\');
                    }
                    out.push(*c);
                }
                out.push(']');
                i = close + 1;
            }
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| format!("trailing escape in {:?}", pattern))?;
                out.push_str(&regex::escape(&escaped.to_string()));
                i += 2;
            }
            c => {
                out.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    Ok(out)
}

/// What a rule assigns to the paths it matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Property { name: String, value: String },
    Filter(String),
}

/// One pattern → assignment pair from a rule file
#[derive(Debug, Clone)]
pub struct AttributeRule {
    pub wildcard: Wildcard,
    pub assignment: Assignment,
}

/// Parse the content of a rule file.
///
/// Text after `#` is ignored. Lines with an invalid pattern are skipped with
/// a warning.
pub fn parse_rules(content: &str) -> Vec<AttributeRule> {
    let mut rules = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut tokens = line.split_whitespace();
        let Some(pattern) = tokens.next() else {
            continue;
        };
        let tokens: Vec<&str> = tokens.collect();

        let mut assignments = Vec::new();
        if tokens.iter().any(|t| t.starts_with("binary")) {
            assignments.push(Assignment::Property {
                name: svn_props::MIME_TYPE.to_string(),
                value: svn_props::BINARY_MIME_TYPE.to_string(),
            });
        }
        if let Some(eol) = tokens.iter().find_map(|t| eol_style(t)) {
            assignments.push(Assignment::Property {
                name: svn_props::EOL_STYLE.to_string(),
                value: eol.to_string(),
            });
        }
        if let Some(filter) = tokens.iter().find_map(|t| t.strip_prefix(FILTER_PREFIX)) {
            assignments.push(Assignment::Filter(filter.to_string()));
        }
        if assignments.is_empty() {
            continue;
        }

        let wildcard = match Wildcard::new(pattern) {
            Ok(wildcard) => wildcard,
            Err(e) => {
                warn!("Found invalid git pattern: {} ({})", line.trim(), e);
                continue;
            }
        };
        for assignment in assignments {
            rules.push(AttributeRule {
                wildcard: wildcard.clone(),
                assignment,
            });
        }
    }
    rules
}

fn eol_style(token: &str) -> Option<&'static str> {
    match token.strip_prefix(EOL_PREFIX)? {
        "lf" => Some(svn_props::EOL_STYLE_LF),
        "native" => Some(svn_props::EOL_STYLE_NATIVE),
        "cr" => Some(svn_props::EOL_STYLE_CR),
        "crlf" => Some(svn_props::EOL_STYLE_CRLF),
        _ => None,
    }
}

/// `svn:auto-props` value for a directory holding `rules`.
///
/// One line per Subversion-compatible pattern:
/// `<pattern> = <name>=<value>[;<name>=<value>...]`
pub fn auto_props(rules: &[AttributeRule]) -> Option<String> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_pattern: BTreeMap<&str, Properties> = BTreeMap::new();
    for rule in rules {
        let Assignment::Property { name, value } = &rule.assignment else {
            continue;
        };
        if !rule.wildcard.is_svn_compatible() {
            continue;
        }
        let pattern = rule.wildcard.pattern();
        if !by_pattern.contains_key(pattern) {
            order.push(pattern);
        }
        by_pattern
            .entry(pattern)
            .or_default()
            .insert(name.clone(), value.clone());
    }
    if order.is_empty() {
        return None;
    }

    let mut result = String::new();
    for pattern in order {
        let props: Vec<String> = by_pattern[pattern]
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        result.push_str(&format!("{} = {}\n", pattern, props.join(";")));
    }
    Some(result)
}

/// Rules of one directory's rule file
#[derive(Debug)]
struct RuleScope {
    dir: String,
    rules: Vec<AttributeRule>,
}

/// Rule-derived attributes of a single file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub properties: Properties,
    pub filter: Option<String>,
}

/// Rule files in effect for a directory, outermost first
#[derive(Debug, Clone, Default)]
pub struct InheritedRules {
    scopes: Vec<Arc<RuleScope>>,
}

impl InheritedRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the children of `dir`, given the rules of its own rule file
    pub fn child(&self, dir: &str, rules: Vec<AttributeRule>) -> Self {
        let mut scopes = self.scopes.clone();
        if !rules.is_empty() {
            scopes.push(Arc::new(RuleScope {
                dir: dir.to_string(),
                rules,
            }));
        }
        Self { scopes }
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Fold every matching rule for the file at `file_path`
    pub fn file_attributes(&self, file_path: &str) -> FileAttributes {
        let mut attributes = FileAttributes::default();
        for scope in &self.scopes {
            let Some(relative) = path::relative(&scope.dir, file_path) else {
                continue;
            };
            for rule in scope.rules.iter().filter(|r| r.wildcard.matches(relative, false)) {
                match &rule.assignment {
                    Assignment::Property { name, value } => {
                        attributes.properties.insert(name.clone(), value.clone());
                    }
                    Assignment::Filter(name) => attributes.filter = Some(name.clone()),
                }
            }
        }
        attributes
    }
}

/// The rule file among a directory's `entries`
pub fn rules_entry(entries: &[TreeEntry]) -> Option<&TreeEntry> {
    entries
        .iter()
        .find(|e| e.name == ATTRIBUTES_FILE && e.mode.is_blob())
}

/// Load the rule file among a directory's `entries`, if there is one
pub async fn load_rules(store: &dyn ObjectStore, entries: &[TreeEntry]) -> Result<Vec<AttributeRule>> {
    let Some(entry) = rules_entry(entries) else {
        return Ok(Vec::new());
    };
    let data = store.open_kind(&entry.id, ObjectKind::Blob).await?;
    Ok(parse_rules(&String::from_utf8_lossy(&data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wildcard(pattern: &str) -> Wildcard {
        Wildcard::new(pattern).unwrap()
    }

    #[test]
    fn test_unanchored_pattern_matches_name_at_any_depth() {
        let w = wildcard("*.bin");
        assert!(w.matches("big.bin", false));
        assert!(w.matches("deep/dir/big.bin", false));
        assert!(!w.matches("big.bin.txt", false));
        assert!(w.is_svn_compatible());
    }

    #[test]
    fn test_anchored_patterns() {
        let w = wildcard("docs/*.txt");
        assert!(w.matches("docs/a.txt", false));
        assert!(!w.matches("other/docs/a.txt", false));
        assert!(!w.matches("docs/sub/a.txt", false));
        assert!(!w.is_svn_compatible());

        let w = wildcard("/root.txt");
        assert!(w.matches("root.txt", false));
        assert!(!w.matches("sub/root.txt", false));
    }

    #[test]
    fn test_double_star_and_classes() {
        let w = wildcard("assets/**/*.png");
        assert!(w.matches("assets/a.png", false));
        assert!(w.matches("assets/x/y/a.png", false));
        assert!(!w.matches("a.png", false));

        let w = wildcard("file[0-9].?");
        assert!(w.matches("file3.c", false));
        assert!(!w.matches("filex.c", false));

        let w = wildcard("[!a]*");
        assert!(w.matches("b", false));
        assert!(!w.matches("a", false));

        let w = wildcard("build/");
        assert!(w.matches("build", true));
        assert!(!w.matches("build", false));
    }

    #[test]
    fn test_parse_rules() {
        let rules = parse_rules(
            "# comment line\n\
             *.bin binary filter=lfs\n\
             *.txt eol=lf # trailing comment\n\
             *.c text\n\
             [abc eol=crlf\n\
             \n\
             *.sh eol=native\n",
        );
        let assignments: Vec<(&str, &Assignment)> = rules
            .iter()
            .map(|r| (r.wildcard.pattern(), &r.assignment))
            .collect();
        assert_eq!(assignments.len(), 4);
        assert_eq!(assignments[0].0, "*.bin");
        assert_eq!(
            assignments[0].1,
            &Assignment::Property {
                name: svn_props::MIME_TYPE.into(),
                value: svn_props::BINARY_MIME_TYPE.into()
            }
        );
        assert_eq!(assignments[1].1, &Assignment::Filter("lfs".into()));
        assert_eq!(
            assignments[2].1,
            &Assignment::Property {
                name: svn_props::EOL_STYLE.into(),
                value: "LF".into()
            }
        );
        // the malformed "[abc" line is skipped, parsing continues
        assert_eq!(assignments[3].0, "*.sh");
    }

    #[test]
    fn test_inner_rules_override_outer() {
        let root = InheritedRules::new().child("/", parse_rules("*.txt eol=lf\n*.bin filter=lfs\n"));
        let sub = root.child("/sub", parse_rules("*.txt eol=crlf\n"));

        let top = root.file_attributes("/a.txt");
        assert_eq!(top.properties[svn_props::EOL_STYLE], "LF");

        let nested = sub.file_attributes("/sub/a.txt");
        assert_eq!(nested.properties[svn_props::EOL_STYLE], "CRLF");

        let bin = sub.file_attributes("/sub/deeper/big.bin");
        assert_eq!(bin.filter.as_deref(), Some("lfs"));
        assert!(bin.properties.is_empty());

        // sibling directories do not see /sub's rules
        let other = sub.file_attributes("/other/a.txt");
        assert_eq!(other.properties[svn_props::EOL_STYLE], "LF");
    }

    #[test]
    fn test_auto_props() {
        let rules = parse_rules("*.txt eol=lf\n*.bin binary filter=lfs\ndocs/*.md eol=lf\n*.txt binary\n");
        assert_eq!(
            auto_props(&rules).unwrap(),
            "*.txt = svn:eol-style=LF;svn:mime-type=application/octet-stream\n\
             *.bin = svn:mime-type=application/octet-stream\n"
        );
        assert_eq!(auto_props(&parse_rules("*.bin filter=lfs\n")), None);
    }
}
