//! Markup insertion helpers

/// Insert `snippet` before the last `</body>` (any case), or append it when
/// the document has no closing body tag.
pub fn insert_before_body_close(html: &str, snippet: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with the original
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(pos) => {
            let mut out = String::with_capacity(html.len() + snippet.len());
            out.push_str(&html[..pos]);
            out.push_str(snippet);
            out.push_str(&html[pos..]);
            out
        }
        None => format!("{}{}", html, snippet),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserts_before_last_body() {
        let html = "<body>a</body><body>b</body>";
        assert_eq!(
            insert_before_body_close(html, "X"),
            "<body>a</body><body>bX</body>"
        );
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(
            insert_before_body_close("<BODY>hi</BODY>", "X"),
            "<BODY>hiX</BODY>"
        );
    }

    #[test]
    fn test_appends_without_body() {
        assert_eq!(insert_before_body_close("<p>hi</p>", "X"), "<p>hi</p>X");
    }

    #[test]
    fn test_multibyte_content() {
        assert_eq!(
            insert_before_body_close("<body>ünïcødé</body>", "X"),
            "<body>ünïcødéX</body>"
        );
    }
}
