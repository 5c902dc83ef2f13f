//! Allow/ignore glob filtering of repository listings
//!
//! Patterns use shell-glob syntax where `*` also matches `/`, so `*.json`
//! selects JSON files at any depth. A pattern ending in `/` selects the whole
//! directory.

use crate::error::{HubError, HubResult};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Keep items whose key matches any `allow` pattern and no `ignore` pattern
///
/// `None` disables a side of the filter. An empty allow list selects nothing.
pub fn filter_repo_objects<T, F>(
    items: impl IntoIterator<Item = T>,
    allow: Option<&[String]>,
    ignore: Option<&[String]>,
    key: F,
) -> HubResult<Vec<T>>
where
    F: Fn(&T) -> &str,
{
    let allow = allow.map(build_set).transpose()?;
    let ignore = ignore.map(build_set).transpose()?;

    Ok(items
        .into_iter()
        .filter(|item| {
            let path = key(item);
            let allowed = allow.as_ref().is_none_or(|set| set.is_match(path));
            let ignored = ignore.as_ref().is_some_and(|set| set.is_match(path));
            allowed && !ignored
        })
        .collect())
}

fn build_set(patterns: &[String]) -> HubResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let expanded = if pattern.ends_with('/') {
            format!("{}*", pattern)
        } else {
            pattern.clone()
        };

        let glob = GlobBuilder::new(&expanded)
            .literal_separator(false)
            .build()
            .map_err(|e| HubError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.kind().to_string(),
            })?;
        builder.add(glob);
    }

    builder.build().map_err(|e| HubError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<&'static str> {
        vec![
            "config.json",
            "tokenizer.json",
            "model.safetensors",
            "onnx/model.onnx",
            "onnx/config.json",
            "README.md",
        ]
    }

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    fn run(allow: Option<&[&str]>, ignore: Option<&[&str]>) -> Vec<&'static str> {
        let allow = allow.map(patterns);
        let ignore = ignore.map(patterns);
        filter_repo_objects(files(), allow.as_deref(), ignore.as_deref(), |f| *f).unwrap()
    }

    #[test]
    fn test_no_patterns_keeps_everything() {
        assert_eq!(run(None, None), files());
    }

    #[test]
    fn test_star_crosses_directories() {
        assert_eq!(
            run(Some(&["*.json"]), None),
            vec!["config.json", "tokenizer.json", "onnx/config.json"]
        );
    }

    #[test]
    fn test_trailing_slash_selects_directory() {
        assert_eq!(
            run(Some(&["onnx/"]), None),
            vec!["onnx/model.onnx", "onnx/config.json"]
        );
    }

    #[test]
    fn test_ignore_applies_after_allow() {
        assert_eq!(
            run(Some(&["*.json", "*.md"]), Some(&["onnx/*"])),
            vec!["config.json", "tokenizer.json", "README.md"]
        );
    }

    #[test]
    fn test_empty_allow_selects_nothing() {
        assert!(run(Some(&[]), None).is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let allow = patterns(&["model[.bin"]);
        let result = filter_repo_objects(files(), Some(&allow), None, |f| *f);
        assert!(matches!(result, Err(HubError::InvalidPattern { .. })));
    }
}
