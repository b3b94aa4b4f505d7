/// Escape `<>&"'` to HTML entities. Ampersand first so existing entities are
/// not double-escaped out of order.
pub fn sanitize_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

const SQL_PATTERNS: &[&str] = &[
    "' or ",
    "\" or ",
    "or 1=1",
    "union select",
    "drop table",
    "drop database",
    "insert into",
    "delete from",
    "exec(",
    "execute(",
    "xp_",
    "--",
    "/*",
];

/// Conservative denylist. A secondary signal only, never the sole gate for
/// accepting input.
pub fn contains_sql_injection(input: &str) -> bool {
    let lowered = input.to_lowercase();
    SQL_PATTERNS.iter().any(|p| lowered.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_all_dangerous_characters() {
        assert_eq!(
            sanitize_string(r#"<a href="x" onclick='y'>&</a>"#),
            "&lt;a href=&quot;x&quot; onclick=&#x27;y&#x27;&gt;&amp;&lt;/a&gt;"
        );
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(sanitize_string("hello agents"), "hello agents");
    }

    #[test]
    fn flags_classic_injection_fragments() {
        assert!(contains_sql_injection("1' OR '1'='1"));
        assert!(contains_sql_injection("x; DROP TABLE sessions;--"));
        assert!(contains_sql_injection("a UNION SELECT secret FROM keys"));
        assert!(!contains_sql_injection("ordinary sentence about unions"));
    }
}
