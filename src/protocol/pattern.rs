//! Brace expansion and filename matching for transfer requests
// (c) 2025 Ross Younger
//!
//! When the receiver was asked for `host:a{b,c}d`, the shell on our side has
//! already quoted the braces away from the remote shell, so the receiver
//! must expand them itself and then check each incoming basename against the
//! expanded set. This guards against a compromised or confused peer sending
//! files we never asked for.

use anyhow::{Result, bail};
use glob::Pattern;

/// A set of glob patterns an incoming basename must satisfy.
#[derive(Debug)]
pub struct NamePatterns {
    patterns: Vec<Pattern>,
}

impl NamePatterns {
    /// Brace-expands a request and compiles the resulting patterns.
    ///
    /// Unbalanced braces or brackets are a hard error.
    pub fn compile(request: &str) -> Result<Self> {
        let patterns = brace_expand(request)?
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// True if `name` matches any expanded pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Position of the first brace pair in `pattern`, honouring backslash
/// escapes, bracket classes, nesting, and the `{}` find(1) exception.
///
/// Returns `Ok(None)` if there is nothing to expand and an error for
/// unbalanced input.
fn find_brace(pattern: &str) -> Result<Option<(usize, usize)>> {
    let bytes = pattern.as_bytes();
    let mut start = None;
    let mut end = None;
    let mut in_bracket = false;
    let mut level = 0i32;
    let mut i = 0;
    while i < bytes.len() && end.is_none() {
        match bytes[i] {
            b'\\' => {
                if i + 1 < bytes.len() {
                    i += 1;
                }
            }
            b'[' => in_bracket = true,
            b']' => in_bracket = false,
            b'{' if !in_bracket => {
                if bytes.get(i + 1) == Some(&b'}') {
                    // protect a lone {}, as csh does for find(1)
                    i += 1;
                } else {
                    if start.is_none() {
                        start = Some(i);
                    }
                    level += 1;
                }
            }
            b'}' if !in_bracket => {
                if start.is_none() {
                    bail!("invalid brace pattern \"{pattern}\"");
                }
                level -= 1;
                if level <= 0 {
                    end = Some(i);
                }
            }
            _ => (),
        }
        i += 1;
    }
    match (start, end) {
        (Some(s), Some(e)) => Ok(Some((s, e))),
        (None, None) if !in_bracket => Ok(None),
        _ => bail!("invalid brace pattern \"{pattern}\""),
    }
}

/// Expands the first brace group of `pattern`, pushing one new pattern per
/// selection onto the worklist. Returns false if there was nothing to
/// expand.
fn expand_one(pattern: &str, worklist: &mut Vec<String>) -> Result<bool> {
    let Some((brace_start, brace_end)) = find_brace(pattern)? else {
        return Ok(false);
    };
    let bytes = pattern.as_bytes();
    let mut in_bracket = false;
    let mut level = 0i32;
    let mut sel_start = brace_start + 1;
    let mut i = sel_start;
    while i < brace_end {
        match bytes[i] {
            b'{' if !in_bracket => level += 1,
            b'}' if !in_bracket => level -= 1,
            b'[' => in_bracket = true,
            b']' => in_bracket = false,
            b'\\' => {
                if i < brace_end - 1 {
                    i += 1;
                }
            }
            _ => (),
        }
        if (bytes[i] == b',' || i == brace_end - 1) && !in_bracket && level <= 0 {
            let sel_end = if i == brace_end - 1 { brace_end } else { i };
            let expanded = format!(
                "{}{}{}",
                &pattern[..brace_start],
                &pattern[sel_start..sel_end],
                &pattern[brace_end + 1..]
            );
            worklist.push(expanded);
            sel_start = i + 1;
        }
        i += 1;
    }
    if in_bracket || level > 0 {
        bail!("invalid brace pattern \"{pattern}\"");
    }
    Ok(true)
}

/// Fully expands every brace group in `pattern`, returning the basename
/// component of each resulting pattern.
pub fn brace_expand(pattern: &str) -> Result<Vec<String>> {
    let mut active = vec![pattern.to_string()];
    let mut done = Vec::new();
    while let Some(current) = active.pop() {
        if expand_one(&current, &mut active)? {
            continue;
        }
        // fully expanded; keep only the filename component
        let basename = current.rsplit('/').next().unwrap_or(&current);
        done.push(basename.to_string());
    }
    Ok(done)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod test {
    use super::{NamePatterns, brace_expand};
    use pretty_assertions::assert_eq;

    fn expand_sorted(pattern: &str) -> Vec<String> {
        let mut v = brace_expand(pattern).unwrap();
        v.sort();
        v
    }

    #[test]
    fn no_braces_passes_through() {
        assert_eq!(expand_sorted("plain.txt"), vec!["plain.txt"]);
        assert_eq!(expand_sorted("*.rs"), vec!["*.rs"]);
    }

    #[test]
    fn single_group() {
        assert_eq!(expand_sorted("a{b,c}d"), vec!["abd", "acd"]);
    }

    #[test]
    fn nested_groups() {
        assert_eq!(expand_sorted("a{b,c{d,e}}"), vec!["ab", "acd", "ace"]);
    }

    #[test]
    fn empty_selection() {
        assert_eq!(expand_sorted("a{,b}"), vec!["a", "ab"]);
    }

    #[test]
    fn directory_prefix_stripped() {
        assert_eq!(expand_sorted("dir/{x,y}.txt"), vec!["x.txt", "y.txt"]);
    }

    #[test]
    fn braces_in_bracket_class_are_literal() {
        assert_eq!(expand_sorted("a[{]b"), vec!["a[{]b"]);
    }

    #[test]
    fn escaped_brace_is_literal() {
        assert_eq!(expand_sorted(r"a\{b"), vec![r"a\{b"]);
    }

    #[test]
    fn lone_empty_braces_protected() {
        assert_eq!(expand_sorted("a{}b"), vec!["a{}b"]);
    }

    #[test]
    fn unbalanced_rejected() {
        assert!(brace_expand("a{").is_err());
        assert!(brace_expand("a}").is_err());
        assert!(brace_expand("a{b,c").is_err());
        assert!(brace_expand("a{b,{c}").is_err());
    }

    #[test]
    fn name_matching() {
        let pats = NamePatterns::compile("a{b,c{d,e}}").unwrap();
        for name in ["ab", "acd", "ace"] {
            assert!(pats.matches(name), "{name} should match");
        }
        for name in ["ac", "abd", "a", "x"] {
            assert!(!pats.matches(name), "{name} should not match");
        }
    }

    #[test]
    fn wildcard_matching() {
        let pats = NamePatterns::compile("*.{log,txt}").unwrap();
        assert!(pats.matches("foo.log"));
        assert!(pats.matches("bar.txt"));
        assert!(!pats.matches("baz.rs"));
    }
}
