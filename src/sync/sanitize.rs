//! Row sanitizing and the REPLACE upsert statement.
//!
//! Incoming COMPACT values are strings; empty values become the SQL zero
//! value for temporal columns and NULL for everything else, matching the
//! `default '0000-00-00 ...' NOT NULL` DDL the schema generator emits.

use sea_orm::Value;

use crate::catalog::{FieldDef, RetsDataType};

/// SQL zero value for a temporal type.
pub fn zero_value(data_type: &RetsDataType) -> Option<&'static str> {
    match data_type {
        RetsDataType::Date => Some("0000-00-00"),
        RetsDataType::DateTime => Some("0000-00-00 00:00:00"),
        RetsDataType::Time => Some("00:00:00"),
        _ => None,
    }
}

/// Sanitize one incoming field value for binding. `None` field definitions
/// happen when the server returns a column the cached metadata lacks; those
/// values pass through untouched (non-empty) or as NULL.
pub fn sanitize(field: Option<&FieldDef>, raw: &str) -> Value {
    if raw.is_empty() {
        if let Some(zero) = field.and_then(|f| zero_value(&f.data_type)) {
            return Value::String(Some(Box::new(zero.to_string())));
        }
        return Value::String(None);
    }
    Value::String(Some(Box::new(raw.to_string())))
}

/// `REPLACE INTO` statement for an upsert keyed on the table's declared
/// primary key.
pub fn replace_into_sql(table: &str, columns: &[String]) -> String {
    let column_list = columns
        .iter()
        .map(|c| format!("`{}`", c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "REPLACE INTO `{}` ({}) VALUES ({})",
        table, column_list, placeholders
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(data_type: RetsDataType) -> FieldDef {
        FieldDef {
            system_name: "F".into(),
            long_name: String::new(),
            standard_name: String::new(),
            data_type,
            required: false,
        }
    }

    fn as_string(value: Value) -> Option<String> {
        match value {
            Value::String(inner) => inner.map(|b| *b),
            _ => panic!("expected string value"),
        }
    }

    #[test]
    fn empty_temporal_values_become_zero_values() {
        assert_eq!(
            as_string(sanitize(Some(&field(RetsDataType::Date)), "")).as_deref(),
            Some("0000-00-00")
        );
        assert_eq!(
            as_string(sanitize(Some(&field(RetsDataType::DateTime)), "")).as_deref(),
            Some("0000-00-00 00:00:00")
        );
        assert_eq!(
            as_string(sanitize(Some(&field(RetsDataType::Time)), "")).as_deref(),
            Some("00:00:00")
        );
    }

    #[test]
    fn empty_non_temporal_values_become_null() {
        assert_eq!(as_string(sanitize(Some(&field(RetsDataType::Int)), "")), None);
        assert_eq!(
            as_string(sanitize(
                Some(&field(RetsDataType::Character { max_length: Some(20) })),
                ""
            )),
            None
        );
        assert_eq!(as_string(sanitize(None, "")), None);
    }

    #[test]
    fn non_empty_values_pass_through() {
        assert_eq!(
            as_string(sanitize(Some(&field(RetsDataType::Int)), "42")).as_deref(),
            Some("42")
        );
        assert_eq!(as_string(sanitize(None, "free text")).as_deref(), Some("free text"));
    }

    #[test]
    fn replace_statement_shape() {
        let sql = replace_into_sql(
            "Property_RE_1",
            &["L_ListingID".to_string(), "L_Price".to_string()],
        );
        assert_eq!(
            sql,
            "REPLACE INTO `Property_RE_1` (`L_ListingID`, `L_Price`) VALUES (?, ?)"
        );
    }
}
