//! CSV line serialization for output artifacts.

use std::borrow::Cow;

use crate::config::ColumnAlignment;
use crate::message::Record;

/// Quote a field when it contains a delimiter, quote, carriage return or
/// newline. Embedded quotes are doubled.
pub fn escape_field(value: &str) -> Cow<'_, str> {
    if !value.contains(|c: char| matches!(c, ',' | '"' | '\r' | '\n')) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
}

/// Join fields into one `\n`-terminated line.
pub fn format_line<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut line = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_field(field));
    }
    line.push('\n');
    line
}

/// Header line from the field names of `record`
pub fn header_line(record: &Record) -> String {
    format_line(record.keys().map(String::as_str))
}

/// Data line for `record` under `header`.
///
/// Positional alignment writes the record's values in its own order, which
/// misaligns columns when a later record's fields differ from the header.
/// By-name alignment emits one value per header column, empty when missing.
pub fn row_line(record: &Record, header: &[String], alignment: ColumnAlignment) -> String {
    match alignment {
        ColumnAlignment::Positional => format_line(record.values().map(String::as_str)),
        ColumnAlignment::ByName => format_line(
            header
                .iter()
                .map(|column| record.get(column).map(String::as_str).unwrap_or("")),
        ),
    }
}
