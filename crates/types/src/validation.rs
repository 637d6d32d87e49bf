//! Input validation for schema names.
//!
//! Property names are restricted to word characters (`[0-9A-Za-z_]`).
//! Names are validated at the schema boundary; stored data is keyed by id
//! and never revalidated.

use crate::error::Error;

/// Validates a property name: non-empty, word characters only.
///
/// # Errors
///
/// Returns [`Error::InvalidPropertyName`] if the name is empty or contains
/// a character outside `[0-9A-Za-z_]`.
pub fn validate_property_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || !name.chars().all(is_word_char) {
        return Err(Error::InvalidPropertyName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
