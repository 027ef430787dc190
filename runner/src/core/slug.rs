//! Git-ref-safe branch names for newly generated pull requests.

const BRANCH_PREFIX: &str = "devsy/";
const MAX_WORDS: usize = 6;
const MAX_SLUG_LEN: usize = 40;
const FALLBACK_SLUG: &str = "change";

/// Lowercase, hyphen-separated slug of `text`.
///
/// Keeps ASCII alphanumerics only, at most six words and forty characters
/// (cut on a word boundary). Returns `change` when nothing survives.
pub fn slugify(text: &str) -> String {
    let words = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .take(MAX_WORDS);

    let mut slug = String::new();
    for word in words {
        let extra = if slug.is_empty() { 0 } else { 1 };
        if slug.len() + extra + word.len() > MAX_SLUG_LEN {
            if slug.is_empty() {
                slug.push_str(&word[..MAX_SLUG_LEN]);
            }
            break;
        }
        if extra == 1 {
            slug.push('-');
        }
        slug.push_str(&word);
    }

    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug
    }
}

/// Branch name for a generate run: `devsy/<slug>-<run id>`.
///
/// The run id suffix keeps names unique across re-runs of the same prompt.
pub fn branch_name(prompt: &str, run_id: &str) -> String {
    let slug = slugify(first_line(prompt));
    let suffix = slugify(run_id);
    if run_id.trim().is_empty() {
        format!("{BRANCH_PREFIX}{slug}")
    } else {
        format!("{BRANCH_PREFIX}{slug}-{suffix}")
    }
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_lowercase_hyphenated() {
        assert_eq!(slugify("Add  Dark-Mode toggle!"), "add-dark-mode-toggle");
    }

    #[test]
    fn slug_limits_words_and_length() {
        assert_eq!(
            slugify("one two three four five six seven eight"),
            "one-two-three-four-five-six"
        );
        let long = slugify("supercalifragilisticexpialidocious antidisestablishmentarianism");
        assert!(long.len() <= 40, "{long}");
        assert_eq!(long, "supercalifragilisticexpialidocious");
    }

    #[test]
    fn slug_truncates_single_overlong_word() {
        let slug = slugify(&"a".repeat(60));
        assert_eq!(slug.len(), 40);
    }

    #[test]
    fn slug_falls_back_when_empty() {
        assert_eq!(slugify("  ¿¡ ✨ "), "change");
    }

    #[test]
    fn branch_name_uses_first_prompt_line_and_run_id() {
        let name = branch_name("\n  Fix login redirect\nmore details here", "9876543210");
        assert_eq!(name, "devsy/fix-login-redirect-9876543210");
        assert!(!name.contains(char::is_whitespace));
    }

    #[test]
    fn branch_name_without_run_id() {
        assert_eq!(branch_name("Update docs", ""), "devsy/update-docs");
    }
}
