use std::time::Duration;

pub struct Utils {}

impl Utils {
    /// True for plain SQL identifiers: ASCII letters, digits and `_`, not
    /// starting with a digit.
    pub fn is_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    }

    /// Double-quote an identifier for interpolation into DDL.
    pub fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Compare declared column types the way a reader would: case and
    /// whitespace insensitive, so `varchar(100)` matches `VARCHAR( 100 )`.
    pub fn same_decl_type(a: &str, b: &str) -> bool {
        let normalize = |s: &str| {
            s.chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| c.to_ascii_uppercase())
                .collect::<String>()
        };
        normalize(a) == normalize(b)
    }

    pub fn format_elapsed(elapsed: Duration) -> String {
        let millis = elapsed.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else {
            format!("{:.1}s", elapsed.as_secs_f64())
        }
    }
}
