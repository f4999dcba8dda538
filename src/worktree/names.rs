//! Workspace-slug and branch-name derivation.

use std::collections::HashSet;

use rand::seq::SliceRandom;

/// Longest branch name we derive from a session title.
const MAX_BRANCH_LEN: usize = 48;

const ADJECTIVES: [&str; 24] = [
    "muddy", "fuzzy", "sunny", "dusty", "sleepy", "speedy", "shiny", "brave", "quiet", "mellow",
    "witty", "zesty", "cosmic", "gentle", "lively", "merry", "nimble", "plucky", "rustic", "salty",
    "swift", "tidy", "vivid", "wandering",
];

const ANIMALS: [&str; 24] = [
    "cat", "otter", "fox", "lynx", "heron", "badger", "newt", "panda", "crow", "gecko", "koala",
    "lemur", "marmot", "mole", "ocelot", "puffin", "quail", "raven", "seal", "shrew", "stoat",
    "tapir", "vole", "wren",
];

/// Generate a friendly two-word workspace slug not present in `taken`.
/// Falls back to a numeric suffix if the combination space is exhausted.
pub fn generate_slug(taken: &HashSet<String>) -> String {
    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty list");
        let animal = ANIMALS.choose(&mut rng).expect("non-empty list");
        let candidate = format!("{adjective}-{animal}");
        if !taken.contains(&candidate) {
            return candidate;
        }
    }

    let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty list");
    let animal = ANIMALS.choose(&mut rng).expect("non-empty list");
    let mut counter = 2;
    loop {
        let candidate = format!("{adjective}-{animal}-{counter}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Normalize user- or title-provided text into branch-name-safe form:
/// lowercased, alphanumeric runs joined by single hyphens.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Derive a nice-branch candidate from a session title, length-bounded and
/// disambiguated against `is_taken`.
pub fn branch_from_title(title: &str, is_taken: impl Fn(&str) -> bool) -> Option<String> {
    let mut base = slugify(title);
    if base.is_empty() {
        return None;
    }
    if base.len() > MAX_BRANCH_LEN {
        base.truncate(MAX_BRANCH_LEN);
        while base.ends_with('-') {
            base.pop();
        }
    }

    if !is_taken(&base) {
        return Some(base);
    }
    for counter in 2..100 {
        let candidate = format!("{base}-{counter}");
        if !is_taken(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_slug_avoids_taken() {
        let mut taken = HashSet::new();
        for adjective in ADJECTIVES {
            for animal in ANIMALS {
                taken.insert(format!("{adjective}-{animal}"));
            }
        }
        let slug = generate_slug(&taken);
        assert!(!taken.contains(&slug));
        assert!(slug.split('-').count() >= 3);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Implement login flow"), "implement-login-flow");
        assert_eq!(slugify("  Fix:  crash!! on startup "), "fix-crash-on-startup");
        assert_eq!(slugify("___"), "");
    }

    #[test]
    fn test_branch_from_title_bounds_length() {
        let long = "a very long title that keeps going and going and going forever";
        let branch = branch_from_title(long, |_| false).unwrap();
        assert!(branch.len() <= MAX_BRANCH_LEN);
        assert!(!branch.ends_with('-'));
    }

    #[test]
    fn test_branch_from_title_disambiguates() {
        let branch =
            branch_from_title("Implement login flow", |c| c == "implement-login-flow").unwrap();
        assert_eq!(branch, "implement-login-flow-2");
    }

    #[test]
    fn test_branch_from_empty_title() {
        assert!(branch_from_title("!!!", |_| false).is_none());
    }
}
