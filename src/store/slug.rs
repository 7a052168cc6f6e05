//! Task slug derivation.
//!
//! A task's slug doubles as its directory name, so it must be filesystem-
//! and URL-safe: lowercase alphanumerics and hyphens, at most 64 chars.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

const MAX_SLUG_LEN: usize = 64;
const MAX_SLUG_WORDS: usize = 5;

/// Filler words dropped when deriving a slug from a task name.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "for", "to", "in", "on", "at", "by", "with",
    "from", "into", "is", "are", "was", "were", "be", "this", "that",
];

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("static regex"));

/// True when `s` is already usable as a slug/directory name.
pub fn is_valid_slug(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_SLUG_LEN && SLUG_RE.is_match(s)
}

/// Derive a slug from a free-form task name.
///
/// Returns `(slug, modified)` where `modified` is false when the trimmed,
/// lowercased input was already a valid slug and passed through unchanged.
pub fn slugify(name: &str) -> (String, bool) {
    let normalized = name.trim().to_lowercase();
    if is_valid_slug(&normalized) {
        return (normalized, false);
    }

    let cleaned: String = normalized
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let words: Vec<&str> = cleaned
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|w| !w.is_empty())
        .filter(|w| !STOP_WORDS.contains(w))
        .take(MAX_SLUG_WORDS)
        .collect();

    let mut slug = words.join("-");
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-').to_string();

    if slug.is_empty() {
        ("task".to_string(), true)
    } else {
        (slug, true)
    }
}

/// Append `-2`, `-3`, … until the name does not collide with an existing
/// entry in `dir`. A missing `dir` means no collisions are possible.
pub fn deduplicate_slug(dir: &Path, base: &str) -> String {
    if !dir.join(base).exists() {
        return base.to_string();
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_slug_passes_through() {
        assert_eq!(slugify("my-task"), ("my-task".to_string(), false));
    }

    #[test]
    fn case_is_folded_without_counting_as_modified() {
        assert_eq!(slugify("My-Task"), ("my-task".to_string(), false));
    }

    #[test]
    fn stop_words_only_becomes_task() {
        assert_eq!(slugify("the a an"), ("task".to_string(), true));
    }

    #[test]
    fn derives_from_sentence() {
        let (slug, modified) = slugify("Build the login page for admins");
        assert_eq!(slug, "build-login-page-admins");
        assert!(modified);
    }

    #[test]
    fn takes_at_most_five_words() {
        let (slug, _) = slugify("one two three four five six seven!");
        assert_eq!(slug, "one-two-three-four-five");
    }

    #[test]
    fn truncates_and_strips_trailing_hyphen() {
        let long = "x".repeat(63) + " yz";
        let (slug, modified) = slugify(&long);
        assert!(slug.len() <= 64);
        assert!(!slug.ends_with('-'));
        assert!(modified);
    }

    #[test]
    fn dedup_appends_numeric_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(deduplicate_slug(dir.path(), "fix-bug"), "fix-bug");
        std::fs::create_dir(dir.path().join("fix-bug")).expect("mkdir");
        assert_eq!(deduplicate_slug(dir.path(), "fix-bug"), "fix-bug-2");
        std::fs::create_dir(dir.path().join("fix-bug-2")).expect("mkdir");
        assert_eq!(deduplicate_slug(dir.path(), "fix-bug"), "fix-bug-3");
    }

    proptest! {
        #[test]
        fn slugs_always_match_the_shape(name in ".{0,200}") {
            let (slug, _) = slugify(&name);
            prop_assert!(is_valid_slug(&slug), "invalid slug {:?} from {:?}", slug, name);
            prop_assert!(slug.len() <= 64);
        }

        #[test]
        fn slugify_is_idempotent(name in ".{0,200}") {
            let (first, _) = slugify(&name);
            let (second, modified) = slugify(&first);
            prop_assert_eq!(&first, &second);
            prop_assert!(!modified);
        }
    }
}
