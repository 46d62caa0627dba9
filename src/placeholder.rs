//! `?` placeholder translation.
//!
//! Query builders emit `?` markers; PostgreSQL wants `$1`, `$2`, ...
//! The scan is quote-aware: markers inside `'...'` or `"..."` are left
//! alone, a doubled quote inside a region is an escaped quote, and an
//! unmatched quote runs to the end of the string.

/// Rewrite every unquoted `?` to a positional `$n` marker.
pub fn to_positional(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    if chars.peek() == Some(&q) {
                        // Doubled quote: stays inside the region.
                        out.push(q);
                        chars.next();
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => {
                    index += 1;
                    out.push('$');
                    out.push_str(&index.to_string());
                }
                _ => out.push(c),
            },
        }
    }

    out
}

/// Count the placeholders [`to_positional`] would rewrite.
pub fn count(sql: &str) -> usize {
    let mut n = 0;
    let mut quote: Option<u8> = None;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => {
                if bytes.get(i + 1) == Some(&q) {
                    i += 1;
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'?' => n += 1,
                _ => {}
            },
        }
        i += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_replacement() {
        assert_eq!(
            to_positional("SELECT * FROM users WHERE id = ?"),
            "SELECT * FROM users WHERE id = $1"
        );
        assert_eq!(
            to_positional("INSERT INTO t (a, b, c) VALUES (?, ?, ?)"),
            "INSERT INTO t (a, b, c) VALUES ($1, $2, $3)"
        );
    }

    #[test]
    fn test_quoted_regions_untouched() {
        assert_eq!(
            to_positional("SELECT '?' , \"col?\" FROM t WHERE x = ?"),
            "SELECT '?' , \"col?\" FROM t WHERE x = $1"
        );
    }

    #[test]
    fn test_doubled_quote_escape() {
        let sql = "SELECT 'Don''t ask ''why?'' twice'";
        assert_eq!(to_positional(sql), sql);

        let sql = "SELECT 'it''s ?' , ?";
        assert_eq!(to_positional(sql), "SELECT 'it''s ?' , $1");

        let sql = "SELECT \"a\"\"?\" FROM t WHERE b = ?";
        assert_eq!(to_positional(sql), "SELECT \"a\"\"?\" FROM t WHERE b = $1");
    }

    #[test]
    fn test_unmatched_quote_runs_to_end() {
        let sql = "SELECT ? WHERE name = 'open ? ?";
        assert_eq!(to_positional(sql), "SELECT $1 WHERE name = 'open ? ?");
    }

    #[test]
    fn test_no_placeholders() {
        assert_eq!(to_positional("SELECT 1"), "SELECT 1");
        assert_eq!(to_positional(""), "");
    }

    #[test]
    fn test_count_matches_rewrite() {
        assert_eq!(count("a = ? AND b = '?' AND c = ?"), 2);
        assert_eq!(count("'Don''t ask ''why?'' twice'"), 0);
        assert_eq!(count("\"?\" ? '?"), 1);
    }

    #[test]
    fn test_multibyte_text_preserved() {
        assert_eq!(to_positional("SELECT 'héllo', ?"), "SELECT 'héllo', $1");
    }
}
