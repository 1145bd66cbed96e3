use regex::Regex;
use std::sync::LazyLock;

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("uuid pattern")
});
static HEX_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(0x)?[0-9a-f]*[0-9][0-9a-f]*\b").expect("hex pattern"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("ws pattern"));

/// Collapse the volatile parts of a task description so repeated attempts at
/// the same action compare equal: "Retry job 41" and "retry  job 42" both
/// become "retry job #".
pub fn action_signature(task: &str) -> String {
    let text = UUID.replace_all(task, "#");
    let text = HEX_ID.replace_all(&text, "#");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_collapse() {
        assert_eq!(action_signature("Retry job 41"), "retry job #");
        assert_eq!(action_signature("retry   job 42 "), "retry job #");
    }

    #[test]
    fn test_ids_collapse() {
        assert_eq!(
            action_signature("fetch 3f2a9c1e-1b2c-4d5e-8f90-a1b2c3d4e5f6 from cache"),
            "fetch # from cache"
        );
        assert_eq!(action_signature("commit deadbeef42"), "commit #");
    }

    #[test]
    fn test_plain_words_survive() {
        assert_eq!(action_signature("Create Ticket"), "create ticket");
        assert_eq!(action_signature("add cafe"), "add cafe");
    }
}
