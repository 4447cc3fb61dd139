//! Ordered environment mapping and the `${NAME}` interpolation grammar.

use indexmap::IndexMap;

use crate::error::PipelineError;

/// An ordered mapping from environment-variable name to string value.
///
/// Keys are stored exactly as given — lookups are case-sensitive, no folding
/// is applied. "Case-preserving" here means we never normalize a key's case
/// on insertion or lookup, not that lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: IndexMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self {
            vars: IndexMap::new(),
        }
    }

    /// Snapshot the current process environment once. Subsequent changes to
    /// the real process environment are not reflected — this is a point-in-
    /// time copy, matching the original's `env.FromSlice(os.Environ())`.
    pub fn from_current() -> Self {
        let mut vars = IndexMap::new();
        for (k, v) in std::env::vars() {
            vars.insert(k, v);
        }
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Render as `KEY=VALUE` pairs in insertion order, e.g. for merging into
    /// a child process's environment.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Interpolate `$NAME`, `${NAME}`, `${NAME?}`, and `$$` references in `input`
/// against `env`.
///
/// - `$$` → literal `$`
/// - `${NAME}` → the bound value, or an empty string if unbound
/// - `${NAME?}` → the bound value, or `PipelineError::VariableNotSet` if unbound
/// - `$NAME` → greedily matches `[A-Za-z_][A-Za-z0-9_]*`; same lookup rules as `${NAME}`
///
/// A bare `$` not followed by `$`, `{`, or an identifier start is passed
/// through literally (e.g. `$` at end of string, or `$ ` before a space).
pub fn interpolate(env: &Environment, input: &str) -> Result<String, PipelineError> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        if i + 1 >= chars.len() {
            out.push('$');
            i += 1;
            continue;
        }

        let next = chars[i + 1];

        if next == '$' {
            out.push('$');
            i += 2;
            continue;
        }

        if next == '{' {
            if let Some(end) = find_closing_brace(&chars, i + 2) {
                let inner: String = chars[i + 2..end].iter().collect();
                let (name, strict) = match inner.strip_suffix('?') {
                    Some(stripped) => (stripped, true),
                    None => (inner.as_str(), false),
                };
                out.push_str(&resolve(env, name, strict)?);
                i = end + 1;
                continue;
            }
            // Unterminated `${` — pass the `$` through literally and keep scanning.
            out.push('$');
            i += 1;
            continue;
        }

        if is_ident_start(next) {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && is_ident_continue(chars[end]) {
                end += 1;
            }
            let name: String = chars[start..end].iter().collect();
            out.push_str(&resolve(env, &name, false)?);
            i = end;
            continue;
        }

        out.push('$');
        i += 1;
    }

    Ok(out)
}

fn find_closing_brace(chars: &[char], from: usize) -> Option<usize> {
    chars[from..].iter().position(|&c| c == '}').map(|p| from + p)
}

fn resolve(env: &Environment, name: &str, strict: bool) -> Result<String, PipelineError> {
    match env.get(name) {
        Some(v) => Ok(v.to_string()),
        None if strict => Err(PipelineError::VariableNotSet(name.to_string())),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(pairs: &[(&str, &str)]) -> Environment {
        let mut e = Environment::new();
        for (k, v) in pairs {
            e.set(*k, *v);
        }
        e
    }

    #[test]
    fn plain_text_passes_through() {
        let env = Environment::new();
        assert_eq!(interpolate(&env, "hello world").unwrap(), "hello world");
    }

    #[test]
    fn dollar_dollar_is_literal_dollar() {
        let env = Environment::new();
        assert_eq!(interpolate(&env, "$$5 is cheap").unwrap(), "$5 is cheap");
    }

    #[test]
    fn braced_lookup_or_empty() {
        let env = env_with(&[("FOO", "bar")]);
        assert_eq!(interpolate(&env, "x=${FOO} y=${MISSING}").unwrap(), "x=bar y=");
    }

    #[test]
    fn braced_strict_lookup_errors_on_missing() {
        let env = Environment::new();
        let err = interpolate(&env, "${MISSING?}").unwrap_err();
        assert!(matches!(err, PipelineError::VariableNotSet(name) if name == "MISSING"));
    }

    #[test]
    fn bare_name_greedy_match() {
        let env = env_with(&[("FOO", "bar"), ("FOO_BAR", "baz")]);
        assert_eq!(interpolate(&env, "$FOO_BAR!").unwrap(), "baz!");
    }

    #[test]
    fn bare_dollar_at_end_is_literal() {
        let env = Environment::new();
        assert_eq!(interpolate(&env, "cost: $").unwrap(), "cost: $");
    }

    #[test]
    fn unterminated_brace_is_literal() {
        let env = Environment::new();
        assert_eq!(interpolate(&env, "${OOPS").unwrap(), "${OOPS");
    }

    #[test]
    fn environment_is_case_preserving() {
        let mut env = Environment::new();
        env.set("Foo", "one");
        env.set("FOO", "two");
        assert_eq!(env.get("Foo"), Some("one"));
        assert_eq!(env.get("FOO"), Some("two"));
    }
}
