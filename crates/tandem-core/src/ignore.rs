//! Gitignore-style exclude rules
//!
//! Supported syntax: blank lines and `#` comments, `!` negation, trailing `/`
//! for directories only, leading or embedded `/` to anchor at the workspace
//! root, `*`, `?` and `**` wildcards. The last matching rule wins.

use std::path::Path;

use tracing::debug;

/// Name of the ignore file read from the workspace root
pub const IGNORE_FILE: &str = ".gitignore";

/// Patterns excluded in every workspace (dependency caches)
pub const DEFAULT_EXCLUDES: &[&str] = &["node_modules/"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    pattern: String,
    negated: bool,
    dir_only: bool,
    anchored: bool,
}

impl Rule {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (negated, rest) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line.strip_prefix('\\').unwrap_or(line)),
        };
        let (dir_only, rest) = match rest.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let anchored = rest.contains('/');
        let pattern = rest.trim_start_matches('/').to_string();
        if pattern.is_empty() {
            return None;
        }

        Some(Self {
            pattern,
            negated,
            dir_only,
            anchored,
        })
    }

    fn matches(&self, rel: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.anchored {
            glob_match(self.pattern.as_bytes(), rel.as_bytes())
        } else {
            let name = rel.rsplit('/').next().unwrap_or(rel);
            glob_match(self.pattern.as_bytes(), name.as_bytes())
        }
    }
}

/// Ordered set of exclude rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeRules {
    rules: Vec<Rule>,
}

impl ExcludeRules {
    /// Rules from pattern lines, after the built-in defaults
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::default();
        rules.extend(DEFAULT_EXCLUDES.iter().copied());
        rules.extend(patterns);
        rules
    }

    /// Defaults, then the root's ignore file if present, then `extra`
    pub fn load(root: &Path, extra: &[String]) -> Self {
        let mut rules = Self::new(std::iter::empty::<&str>());
        let ignore_file = root.join(IGNORE_FILE);
        match std::fs::read_to_string(&ignore_file) {
            Ok(content) => {
                debug!("Loaded exclude rules from {:?}", ignore_file);
                rules.extend(content.lines());
            }
            Err(_) => debug!("No {} in {:?}", IGNORE_FILE, root),
        }
        rules.extend(extra);
        rules
    }

    pub fn extend<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules
            .extend(patterns.into_iter().filter_map(|p| Rule::parse(p.as_ref())));
    }

    /// Whether a `/`-separated workspace-relative path is excluded.
    ///
    /// Callers walk top-down and prune excluded directories, so a path inside
    /// an excluded directory is never asked about.
    pub fn is_excluded(&self, rel: &str, is_dir: bool) -> bool {
        let mut excluded = false;
        for rule in &self.rules {
            if rule.matches(rel, is_dir) {
                excluded = !rule.negated;
            }
        }
        excluded
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Glob match where `*` and `?` stop at `/` and `**` crosses directories.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') if pattern.get(1) == Some(&b'*') => {
            let mut rest = &pattern[2..];
            // "**/" also matches zero directories
            if rest.first() == Some(&b'/') {
                if glob_match(&rest[1..], text) {
                    return true;
                }
                rest = &rest[1..];
            }
            (0..=text.len()).any(|i| {
                (i == 0 || text[i - 1] == b'/' || rest.is_empty()) && glob_match(rest, &text[i..])
            })
        }
        Some(b'*') => {
            let rest = &pattern[1..];
            for i in 0..=text.len() {
                if glob_match(rest, &text[i..]) {
                    return true;
                }
                if i < text.len() && text[i] == b'/' {
                    break;
                }
            }
            false
        }
        Some(b'?') => match text.first() {
            Some(&c) if c != b'/' => glob_match(&pattern[1..], &text[1..]),
            _ => false,
        },
        Some(&p) => text.first() == Some(&p) && glob_match(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_basics() {
        assert!(glob_match(b"*.log", b"debug.log"));
        assert!(!glob_match(b"*.log", b"logs/debug.log"));
        assert!(glob_match(b"file?.txt", b"file1.txt"));
        assert!(!glob_match(b"file?.txt", b"file10.txt"));
        assert!(glob_match(b"docs/**/*.md", b"docs/a/b/c.md"));
        assert!(glob_match(b"docs/**/*.md", b"docs/c.md"));
        assert!(glob_match(b"**/build", b"x/y/build"));
        assert!(glob_match(b"**/build", b"build"));
        assert!(glob_match(b"out/**", b"out/a/b"));
    }

    #[test]
    fn test_default_excludes_dependency_cache() {
        let rules = ExcludeRules::new(std::iter::empty::<&str>());
        assert!(rules.is_excluded("node_modules", true));
        assert!(rules.is_excluded("pkg/node_modules", true));
        assert!(!rules.is_excluded("node_modules", false));
        assert!(!rules.is_excluded("src", true));
    }

    #[test]
    fn test_unanchored_matches_any_level() {
        let rules = ExcludeRules::new(["*.tmp", "target/"]);
        assert!(rules.is_excluded("a.tmp", false));
        assert!(rules.is_excluded("deep/dir/b.tmp", false));
        assert!(rules.is_excluded("crates/x/target", true));
        assert!(!rules.is_excluded("target", false));
    }

    #[test]
    fn test_anchored_patterns() {
        let rules = ExcludeRules::new(["/build", "docs/private"]);
        assert!(rules.is_excluded("build", true));
        assert!(!rules.is_excluded("src/build", true));
        assert!(rules.is_excluded("docs/private", true));
        assert!(!rules.is_excluded("other/docs/private", true));
    }

    #[test]
    fn test_negation_and_comments() {
        let rules = ExcludeRules::new(["# comment", "", "*.log", "!keep.log"]);
        assert_eq!(rules.len(), 3); // node_modules/ + two patterns
        assert!(rules.is_excluded("x.log", false));
        assert!(!rules.is_excluded("keep.log", false));
    }

    #[test]
    fn test_load_reads_ignore_file() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join(IGNORE_FILE), "*.secret\n").unwrap();

        let rules = ExcludeRules::load(temp.path(), &["dist/".to_string()]);
        assert!(rules.is_excluded("api.secret", false));
        assert!(rules.is_excluded("dist", true));
        assert!(rules.is_excluded("node_modules", true));
    }
}
