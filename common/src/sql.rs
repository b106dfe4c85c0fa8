//! Identifier / literal formatting shared by every statement builder.

/// Quote an identifier with backticks, doubling any backtick inside the
/// source name. Handles arbitrary UTF-8 names.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for ch in name.chars() {
        if ch == '`' {
            out.push('`');
        }
        out.push(ch);
    }
    out.push('`');
    out
}

/// Render a SQL string literal with single quotes.
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod test {
    use super::{quote_ident, quote_string};

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("t1"), "`t1`");
        assert_eq!(quote_ident("weird`name"), "`weird``name`");
        // 非 ASCII 表名
        assert_eq!(
            quote_ident("(╯°□°）╯︵ ┻━┻"),
            "`(╯°□°）╯︵ ┻━┻`"
        );
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(quote_string("a'b"), "'a''b'");
        assert_eq!(quote_string("a\\b"), "'a\\\\b'");
    }
}
