//! Identifier allow-listing and quoting.
//!
//! Schema, table and column names cannot be bound as statement parameters,
//! so every name that ends up interpolated into SQL goes through
//! [`quote_identifier`] first. Only plain SQL identifiers are accepted:
//! a letter or underscore followed by letters, digits, `_` or `$`.

use crate::error::{Result, SyncError};

/// PostgreSQL truncates identifiers beyond 63 bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Check a name against the identifier allow-list.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::invalid_identifier(name, "identifier is empty"));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::invalid_identifier(
            name,
            format!(
                "identifier exceeds {MAX_IDENTIFIER_LENGTH} bytes (got {})",
                name.len()
            ),
        ));
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok {
        return Err(SyncError::invalid_identifier(
            name,
            "identifier must start with a letter or underscore",
        ));
    }

    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$')) {
        return Err(SyncError::invalid_identifier(
            name,
            format!("identifier contains disallowed character {bad:?}"),
        ));
    }

    Ok(())
}

/// Validate and double-quote an identifier.
pub fn quote_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

/// Validate and quote `schema.table`.
pub fn qualify(schema: &str, table: &str) -> Result<String> {
    Ok(format!(
        "{}.{}",
        quote_identifier(schema)?,
        quote_identifier(table)?
    ))
}

/// Validate a declared column type before it is used in a `CAST`.
///
/// Declared types come from the catalog (`double precision`, `numeric(10,2)`,
/// `_int4`), so spaces, parentheses and commas are allowed on top of the
/// identifier alphabet. Nothing else is.
pub fn validate_type_name(declared: &str) -> Result<()> {
    let trimmed = declared.trim();
    if trimmed.is_empty() {
        return Err(SyncError::invalid_identifier(declared, "type name is empty"));
    }
    if trimmed.len() > 2 * MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::invalid_identifier(declared, "type name too long"));
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | ',')))
    {
        return Err(SyncError::invalid_identifier(
            declared,
            format!("type name contains disallowed character {bad:?}"),
        ));
    }
    Ok(())
}

/// Split an optionally schema-qualified routine name (`proc` or `schema.proc`)
/// and validate both parts.
pub fn split_qualified(name: &str) -> Result<(Option<&str>, &str)> {
    match name.split_once('.') {
        Some((schema, routine)) => {
            validate_identifier(schema)?;
            validate_identifier(routine)?;
            Ok((Some(schema), routine))
        }
        None => {
            validate_identifier(name)?;
            Ok((None, name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_identifiers_pass() {
        assert!(validate_identifier("orders").is_ok());
        assert!(validate_identifier("ORDER_LINES").is_ok());
        assert!(validate_identifier("_tmp$1").is_ok());
    }

    #[test]
    fn test_injection_attempts_rejected() {
        assert!(validate_identifier("orders; DROP TABLE x").is_err());
        assert!(validate_identifier("orders\"--").is_err());
        assert!(validate_identifier("1orders").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_quote_and_qualify() {
        assert_eq!(quote_identifier("users").unwrap(), "\"users\"");
        assert_eq!(qualify("stage", "users").unwrap(), "\"stage\".\"users\"");
        assert!(qualify("stage", "us ers").is_err());
    }

    #[test]
    fn test_type_names() {
        assert!(validate_type_name("double precision").is_ok());
        assert!(validate_type_name("numeric(10,2)").is_ok());
        assert!(validate_type_name("_int4").is_ok());
        assert!(validate_type_name("text); DROP TABLE x; --").is_err());
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("refresh").unwrap(), (None, "refresh"));
        assert_eq!(
            split_qualified("stage.refresh").unwrap(),
            (Some("stage"), "refresh")
        );
        assert!(split_qualified("stage.re fresh").is_err());
    }
}
