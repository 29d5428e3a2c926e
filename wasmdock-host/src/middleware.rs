//! Middleware classification and route rules.
//!
//! A module whose source directory carries a `rule.txt` is registered as a
//! middleware; the file's single trimmed line decides which routes it runs
//! for. Middlewares execute in registration order ahead of the endpoint.

use std::fmt;
use std::path::Path;

use crate::module::Module;

/// Routing predicate for one middleware.
///
/// Grammar of `rule.txt` (one trimmed line):
///
/// - `*` or empty → applies to every route;
/// - comma-separated tokens: a bare `name` appends to `only`, a `-name`
///   token sets `all` and appends to `except`.
///
/// Once `all` is set, [`Rule::matches`] is `route ∉ except`; a mixed rule
/// like `"users,-admin"` therefore matches everything except `admin`, the
/// `only` list notwithstanding. Existing rule files rely on this precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    pub all: bool,
    pub only: Vec<String>,
    pub except: Vec<String>,
}

impl Rule {
    /// Whether this rule applies to `route`.
    pub fn matches(&self, route: &str) -> bool {
        if self.all {
            return !self.except.iter().any(|e| e == route);
        }
        self.only.iter().any(|o| o == route)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all && self.except.is_empty() {
            return f.write_str("*");
        }
        let mut tokens: Vec<String> = self.only.clone();
        tokens.extend(self.except.iter().map(|e| format!("-{e}")));
        f.write_str(&tokens.join(","))
    }
}

/// Parses the content of a `rule.txt`.
pub fn parse_rule(content: &str) -> Rule {
    let content = content.trim();
    if content == "*" || content.is_empty() {
        return Rule {
            all: true,
            ..Rule::default()
        };
    }

    let mut rule = Rule::default();
    for token in content.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some(name) = token.strip_prefix('-') {
            rule.all = true;
            rule.except.push(name.to_string());
        } else {
            rule.only.push(token.to_string());
        }
    }
    rule
}

/// A module paired with its routing rule.
#[derive(Clone)]
pub struct MiddlewareModule {
    pub module: Module,
    pub rule: Rule,
}

impl MiddlewareModule {
    pub fn matches(&self, route: &str) -> bool {
        self.rule.matches(route)
    }
}

/// Returns the middlewares applicable to `route`, preserving registration
/// order.
pub fn apply_pipeline(route: &str, middlewares: &[MiddlewareModule]) -> Vec<MiddlewareModule> {
    middlewares
        .iter()
        .filter(|mw| mw.matches(route))
        .cloned()
        .collect()
}

/// Reads `<modules_root>/<name>/rule.txt`. `None` means the module is an
/// endpoint, not a middleware.
pub fn load_rule(modules_root: &Path, name: &str) -> Option<Rule> {
    let path = modules_root.join(name).join("rule.txt");
    let content = std::fs::read_to_string(path).ok()?;
    Some(parse_rule(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(only: &[&str]) -> Vec<String> {
        only.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_rule() {
        let cases = [
            ("*", Rule { all: true, only: vec![], except: vec![] }),
            ("", Rule { all: true, only: vec![], except: vec![] }),
            ("  ", Rule { all: true, only: vec![], except: vec![] }),
            (
                "users,auth",
                Rule { all: false, only: names(&["users", "auth"]), except: vec![] },
            ),
            (
                "-auth",
                Rule { all: true, only: vec![], except: names(&["auth"]) },
            ),
            (
                "users,-admin",
                Rule { all: true, only: names(&["users"]), except: names(&["admin"]) },
            ),
        ];
        for (content, want) in cases {
            assert_eq!(parse_rule(content), want, "parse_rule({content:?})");
        }
    }

    #[test]
    fn test_matches() {
        let cases: [(&str, Rule, &[(&str, bool)]); 3] = [
            (
                "all",
                Rule { all: true, only: vec![], except: vec![] },
                &[("any", true), ("other", true)],
            ),
            (
                "only",
                Rule { all: false, only: names(&["users", "auth"]), except: vec![] },
                &[("users", true), ("auth", true), ("other", false)],
            ),
            (
                "except",
                Rule { all: true, only: vec![], except: names(&["auth"]) },
                &[("users", true), ("auth", false), ("any", true)],
            ),
        ];
        for (label, rule, table) in cases {
            for (route, want) in table {
                assert_eq!(rule.matches(route), *want, "{label}.matches({route})");
            }
        }
    }

    #[test]
    fn test_mixed_rule_except_takes_precedence() {
        // "users,-admin" keeps the only list but all=true wins: everything
        // but admin matches.
        let rule = parse_rule("users,-admin");
        assert!(rule.matches("users"));
        assert!(rule.matches("anything-else"));
        assert!(!rule.matches("admin"));
    }

    #[test]
    fn test_display_round_trips_semantics() {
        for content in ["*", "users,auth", "-auth", "users,-admin", "a,b,-c,-d"] {
            let rule = parse_rule(content);
            let reparsed = parse_rule(&rule.to_string());
            for route in ["users", "auth", "admin", "a", "b", "c", "d", "zzz"] {
                assert_eq!(
                    rule.matches(route),
                    reparsed.matches(route),
                    "round trip of {content:?} diverges on {route:?}"
                );
            }
        }
    }

    #[test]
    fn test_apply_pipeline_preserves_order() {
        use crate::bridge::HostBridge;
        use crate::module::ModuleLoader;
        use std::sync::Arc;

        let loader = ModuleLoader::new(1024 * 1024, None).unwrap();
        let bridge = HostBridge::new(wasmdock_bus::Bus::new(), Arc::new(|_, _| {}), Arc::new(|_| {}));
        let module = |name: &str| loader.load(name, b"(module)", &bridge).unwrap();

        let mws = vec![
            MiddlewareModule { module: module("mw1"), rule: parse_rule("*") },
            MiddlewareModule { module: module("mw2"), rule: parse_rule("users") },
            MiddlewareModule { module: module("mw3"), rule: parse_rule("-users") },
        ];

        let picked: Vec<_> = apply_pipeline("users", &mws)
            .iter()
            .map(|mw| mw.module.name().to_string())
            .collect();
        assert_eq!(picked, ["mw1", "mw2"]);

        let picked: Vec<_> = apply_pipeline("auth", &mws)
            .iter()
            .map(|mw| mw.module.name().to_string())
            .collect();
        assert_eq!(picked, ["mw1", "mw3"]);
    }

    #[test]
    fn test_load_rule_classification() {
        let tmp = TempDir::new().unwrap();
        assert!(load_rule(tmp.path(), "users").is_none());

        std::fs::create_dir_all(tmp.path().join("auth")).unwrap();
        std::fs::write(tmp.path().join("auth").join("rule.txt"), "users,accounts\n").unwrap();
        let rule = load_rule(tmp.path(), "auth").unwrap();
        assert_eq!(rule.only, names(&["users", "accounts"]));
        assert!(!rule.all);
    }
}
