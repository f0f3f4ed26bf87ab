//! SQL identifier helpers.

use regex::Regex;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Quote an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Is `name` a plain identifier that needs no escaping?
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}
