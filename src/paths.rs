//! Expansion of task input/output path specs into concrete file lists.
//!
//! A spec is a slash-delimited relative path, optionally a glob (`*`, `?`,
//! `[`, with `**` crossing directories) and optionally negated with a
//! leading `!`.  Specs are applied in order against an accumulating set, so
//! `["**/*", "!**/*.md"]` means "everything except markdown".

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

fn has_glob_meta(s: &str) -> bool {
    // Only the common glob metacharacters are treated as special.
    s.contains(['*', '?', '['])
}

/// Splits a raw spec into a normalised pattern and its negation flag.
/// A leading `\!` or `\:` escapes the literal character.
fn parse_spec(raw: &str) -> anyhow::Result<(String, bool)> {
    if raw.is_empty() {
        bail!("path must not be empty");
    }

    let mut neg = false;
    let mut pat = raw;
    if pat.starts_with("\\!") || pat.starts_with("\\:") {
        pat = &pat[1..];
    } else if let Some(rest) = pat.strip_prefix('!') {
        if rest.is_empty() {
            bail!("negated pattern must not be empty");
        }
        neg = true;
        pat = rest;
    }

    let pat = pat.strip_prefix("./").unwrap_or(pat);
    if pat.is_empty() {
        bail!("path must not be empty");
    }
    Ok((pat.to_string(), neg))
}

/// Expands specs against the current directory.
pub fn expand_specs(specs: &[String]) -> anyhow::Result<Vec<String>> {
    expand_specs_in(Path::new("."), specs)
}

/// Expands specs against `root`, returning sorted, de-duplicated,
/// slash-delimited paths relative to `root`.
pub fn expand_specs_in(root: &Path, specs: &[String]) -> anyhow::Result<Vec<String>> {
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for raw in specs {
        let (pat, neg) = parse_spec(raw)?;

        if has_glob_meta(&pat) {
            if Path::new(&pat).is_absolute() {
                bail!("glob pattern must be relative: {:?}", raw);
            }
            expand_glob(root, raw, &pat, neg, &mut seen)?;
            continue;
        }

        // Non-glob path.
        if neg {
            if root.join(&pat).is_dir() {
                let prefix = format!("{}/", pat.trim_end_matches('/'));
                seen.retain(|p| !p.starts_with(&prefix));
            } else {
                // Missing files are fine to "remove".
                seen.remove(&pat);
            }
            continue;
        }

        let meta = std::fs::metadata(root.join(&pat)).with_context(|| format!("stat {:?}", raw))?;
        if meta.is_dir() {
            let suggestion = format!("{}/**/*", pat);
            bail!("path {:?} is a directory; use a glob like {:?}", raw, suggestion);
        }
        if !meta.is_file() {
            bail!("path {:?} is not a regular file", raw);
        }
        seen.insert(pat);
    }

    Ok(seen.into_iter().collect())
}

fn expand_glob(
    root: &Path,
    raw: &str,
    pat: &str,
    neg: bool,
    seen: &mut BTreeSet<String>,
) -> anyhow::Result<()> {
    // The glob crate has no notion of a filesystem root, so prefix the
    // (escaped) root onto the pattern and strip it from the matches.
    let full = if root == Path::new(".") {
        pat.to_string()
    } else {
        format!("{}/{}", glob::Pattern::escape(&root.to_string_lossy()), pat)
    };

    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let mut matches = Vec::new();
    for entry in glob::glob_with(&full, options).with_context(|| format!("glob {:?}", raw))? {
        let path = entry.with_context(|| format!("glob {:?}", raw))?;
        matches.push(rel_slash_path(root, &path));
    }
    matches.sort();

    let mut added = 0;
    for m in matches {
        if m.is_empty() {
            continue;
        }
        if neg {
            seen.remove(&m);
            continue;
        }
        if seen.contains(&m) {
            continue;
        }
        let meta =
            std::fs::metadata(root.join(&m)).with_context(|| format!("stat {:?} (from {:?})", m, raw))?;
        if meta.is_dir() {
            continue;
        }
        if !meta.is_file() {
            bail!("glob {:?} matched non-regular path {:?}", raw, m);
        }
        seen.insert(m);
        added += 1;
    }

    if !neg && added == 0 {
        bail!("glob {:?} matched no files", raw);
    }
    Ok(())
}

/// Renders a glob match as a slash-delimited path relative to `root`.
fn rel_slash_path(root: &Path, path: &Path) -> String {
    let rel = if root == Path::new(".") {
        path
    } else {
        path.strip_prefix(root).unwrap_or(path)
    };
    let s = rel.to_string_lossy();
    let s = if std::path::MAIN_SEPARATOR == '\\' {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    };
    s.strip_prefix("./").unwrap_or(&s).to_string()
}
