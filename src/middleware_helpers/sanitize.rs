use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum length (in characters) kept from any sanitized free-text field.
pub const MAX_FIELD_LENGTH: usize = 255;

static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<>]*>").expect("valid tag regex"));
static SCRIPT_SCHEME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)javascript:").expect("valid scheme regex"));
static EVENT_HANDLER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)on\w+=").expect("valid handler regex"));

/// Sanitize a visitor-supplied text field.
///
/// Removes markup (`<b>`, stray `<`/`>`), `javascript:` schemes and inline
/// `on<event>=` handlers, then truncates to [`MAX_FIELD_LENGTH`] characters.
/// Removal repeats until the value stops changing so that sanitizing a
/// sanitized value returns it unchanged.
pub fn sanitize_field(input: &str) -> String {
    let mut current = input.replace('\0', "").trim().to_string();

    loop {
        let stripped = strip_once(&current);
        if stripped == current {
            break;
        }
        current = stripped;
    }

    if current.chars().count() > MAX_FIELD_LENGTH {
        current = current.chars().take(MAX_FIELD_LENGTH).collect();
    }

    current.trim().to_string()
}

fn strip_once(input: &str) -> String {
    let without_tags = TAG_PATTERN.replace_all(input, "");
    let without_brackets: String = without_tags
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect();
    let without_scheme = SCRIPT_SCHEME_PATTERN.replace_all(&without_brackets, "");
    EVENT_HANDLER_PATTERN
        .replace_all(&without_scheme, "")
        .trim()
        .to_string()
}

/// Normalize an email address for comparison and storage.
pub fn normalize_email(input: &str) -> String {
    input.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("  Ada Lovelace ", "Ada Lovelace" ; "trims whitespace")]
    #[test_case("<b>Bob</b>", "Bob" ; "strips tags")]
    #[test_case("a<b", "ab" ; "strips stray brackets")]
    #[test_case("JavaScript:alert(1)", "alert(1)" ; "strips script scheme case insensitively")]
    #[test_case("Eve onClick=steal()", "Eve steal()" ; "strips inline handlers")]
    #[test_case("javajavascript:script:x", "x" ; "repeats until stable")]
    #[test_case("on<i>load=</i>", "" ; "handler hidden behind markup")]
    fn sanitizes(input: &str, expected: &str) {
        assert_eq!(sanitize_field(input), expected);
    }

    #[test]
    fn truncates_to_field_limit() {
        let long = "x".repeat(400);
        assert_eq!(sanitize_field(&long).chars().count(), MAX_FIELD_LENGTH);
    }

    #[test]
    fn sanitizing_twice_is_a_no_op() {
        for input in ["<script>x</script>", "  on on=click= y", "Zoë <3 Rust"] {
            let once = sanitize_field(input);
            assert_eq!(sanitize_field(&once), once);
        }
    }

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  USER@Example.COM "), "user@example.com");
    }
}
