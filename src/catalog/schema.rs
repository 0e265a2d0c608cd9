//! SQL schema generation from RETS field definitions.
//!
//! Maps the tagged [`RetsDataType`] variants onto MySQL column types, emits
//! `CREATE TABLE` statements for listing tables and their "visible names"
//! twins, and derives the human-readable column names used by the twins and
//! the `field_name_translations` table.

use crate::catalog::{FieldDef, RetsDataType};

/// Total mapping from a field definition to its MySQL column type.
pub fn sql_type(field: &FieldDef) -> String {
    match &field.data_type {
        RetsDataType::Int | RetsDataType::Small | RetsDataType::Tiny => "INT".to_string(),
        RetsDataType::Long => "BIGINT".to_string(),
        RetsDataType::DateTime => {
            "DATETIME default '0000-00-00 00:00:00' NOT NULL".to_string()
        }
        RetsDataType::Date => "DATE default '0000-00-00' NOT NULL".to_string(),
        RetsDataType::Time => "TIME default '00:00:00' NOT NULL".to_string(),
        RetsDataType::Character { max_length } => match max_length {
            Some(len) if (1..=255).contains(len) => format!("VARCHAR({})", len),
            _ => "TEXT".to_string(),
        },
        RetsDataType::Decimal {
            max_length,
            precision,
        } => match (max_length, precision) {
            (Some(max), Some(prec)) if max > prec => format!("DECIMAL({},{})", max, prec),
            _ => "DECIMAL(10,2)".to_string(),
        },
        RetsDataType::Boolean => "CHAR(1)".to_string(),
        RetsDataType::LookupRef { .. } => "VARCHAR(50)".to_string(),
        RetsDataType::LookupMultiRef { .. } => "TEXT".to_string(),
    }
}

/// `CREATE TABLE` for a listing table. The declared key field becomes an
/// inline primary key; without one, a surrogate auto-increment id leads.
pub fn create_table_sql(table: &str, fields: &[FieldDef], key_field: Option<&str>) -> String {
    let mut columns = Vec::new();

    let has_key = key_field
        .map(|key| fields.iter().any(|f| f.system_name == key))
        .unwrap_or(false);
    if !has_key {
        columns.push("`id` BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY".to_string());
    }

    for field in fields {
        let mut column = format!("`{}` {}", field.system_name, sql_type(field));
        if has_key && key_field == Some(field.system_name.as_str()) {
            column.push_str(" PRIMARY KEY");
        }
        column.push_str(&format!(" COMMENT '{}'", escape_sql(&field.long_name)));
        columns.push(column);
    }

    format!(
        "CREATE TABLE IF NOT EXISTS `{}` (\n  {}\n)",
        table,
        columns.join(",\n  ")
    )
}

/// `CREATE TABLE` for the `<table>_visible` twin: same types, columns named
/// by the LongName transform, MyISAM storage.
pub fn create_visible_table_sql(
    table: &str,
    fields: &[FieldDef],
    key_field: Option<&str>,
) -> String {
    let mut columns = Vec::new();

    let has_key = key_field
        .map(|key| fields.iter().any(|f| f.system_name == key))
        .unwrap_or(false);
    if !has_key {
        columns.push("`id` BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY".to_string());
    }

    for field in fields {
        let name = visible_name(&field.long_name);
        let name = if name.is_empty() {
            field.system_name.clone()
        } else {
            name
        };
        let mut column = format!("`{}` {}", name, sql_type(field));
        if has_key && key_field == Some(field.system_name.as_str()) {
            column.push_str(" PRIMARY KEY");
        }
        column.push_str(&format!(" COMMENT '{}'", escape_sql(&field.system_name)));
        columns.push(column);
    }

    format!(
        "CREATE TABLE IF NOT EXISTS `{}_visible` (\n  {}\n) ENGINE=MyISAM",
        table,
        columns.join(",\n  ")
    )
}

/// Transform a LongName into its visible column name: strip a leading
/// "Number of"/"NumberOf", drop remaining "of" words, then delete every
/// non-alphanumeric character, preserving case.
pub fn visible_name(long_name: &str) -> String {
    let trimmed = long_name.trim();
    let stripped = trimmed
        .strip_prefix("Number of ")
        .or_else(|| trimmed.strip_prefix("NumberOf"))
        .unwrap_or(trimmed);

    stripped
        .split_whitespace()
        .filter(|word| !word.eq_ignore_ascii_case("of"))
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn escape_sql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(system_name: &str, long_name: &str, data_type: RetsDataType) -> FieldDef {
        FieldDef {
            system_name: system_name.to_string(),
            long_name: long_name.to_string(),
            standard_name: String::new(),
            data_type,
            required: false,
        }
    }

    #[test]
    fn numeric_and_temporal_types() {
        assert_eq!(sql_type(&field("a", "", RetsDataType::Int)), "INT");
        assert_eq!(sql_type(&field("a", "", RetsDataType::Small)), "INT");
        assert_eq!(sql_type(&field("a", "", RetsDataType::Tiny)), "INT");
        assert_eq!(sql_type(&field("a", "", RetsDataType::Long)), "BIGINT");
        assert_eq!(
            sql_type(&field("a", "", RetsDataType::DateTime)),
            "DATETIME default '0000-00-00 00:00:00' NOT NULL"
        );
        assert_eq!(
            sql_type(&field("a", "", RetsDataType::Date)),
            "DATE default '0000-00-00' NOT NULL"
        );
        assert_eq!(
            sql_type(&field("a", "", RetsDataType::Time)),
            "TIME default '00:00:00' NOT NULL"
        );
        assert_eq!(sql_type(&field("a", "", RetsDataType::Boolean)), "CHAR(1)");
    }

    #[test]
    fn character_length_bounds() {
        let bounded = RetsDataType::Character { max_length: Some(80) };
        assert_eq!(sql_type(&field("a", "", bounded)), "VARCHAR(80)");

        let max = RetsDataType::Character { max_length: Some(255) };
        assert_eq!(sql_type(&field("a", "", max)), "VARCHAR(255)");

        let oversized = RetsDataType::Character { max_length: Some(256) };
        assert_eq!(sql_type(&field("a", "", oversized)), "TEXT");

        let zero = RetsDataType::Character { max_length: Some(0) };
        assert_eq!(sql_type(&field("a", "", zero)), "TEXT");

        let unknown = RetsDataType::Character { max_length: None };
        assert_eq!(sql_type(&field("a", "", unknown)), "TEXT");
    }

    #[test]
    fn decimal_requires_length_above_precision() {
        let valid = RetsDataType::Decimal { max_length: Some(12), precision: Some(2) };
        assert_eq!(sql_type(&field("a", "", valid)), "DECIMAL(12,2)");

        let inverted = RetsDataType::Decimal { max_length: Some(2), precision: Some(4) };
        assert_eq!(sql_type(&field("a", "", inverted)), "DECIMAL(10,2)");

        let missing = RetsDataType::Decimal { max_length: Some(12), precision: None };
        assert_eq!(sql_type(&field("a", "", missing)), "DECIMAL(10,2)");
    }

    #[test]
    fn lookup_interpretations_override() {
        let single = RetsDataType::LookupRef { lookup_name: "STATUS".into() };
        assert_eq!(sql_type(&field("a", "", single)), "VARCHAR(50)");

        let multi = RetsDataType::LookupMultiRef { lookup_name: "FEATURES".into() };
        assert_eq!(sql_type(&field("a", "", multi)), "TEXT");
    }

    #[test]
    fn create_table_with_key_field_inlines_primary_key() {
        let fields = vec![
            field("L_ListingID", "Listing ID", RetsDataType::Character { max_length: Some(10) }),
            field("L_Price", "List Price", RetsDataType::Decimal { max_length: Some(12), precision: Some(2) }),
        ];
        let sql = create_table_sql("Property_RE_1", &fields, Some("L_ListingID"));
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `Property_RE_1`"));
        assert!(sql.contains("`L_ListingID` VARCHAR(10) PRIMARY KEY COMMENT 'Listing ID'"));
        assert!(sql.contains("`L_Price` DECIMAL(12,2) COMMENT 'List Price'"));
        assert!(!sql.contains("AUTO_INCREMENT"));
    }

    #[test]
    fn create_table_without_key_field_adds_surrogate() {
        let fields = vec![field("A_Name", "Agent Name", RetsDataType::Character { max_length: Some(50) })];
        let sql = create_table_sql("Agent", &fields, None);
        assert!(sql.contains("`id` BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY"));
    }

    #[test]
    fn declared_key_missing_from_fields_falls_back_to_surrogate() {
        let fields = vec![field("A_Name", "Agent Name", RetsDataType::Character { max_length: Some(50) })];
        let sql = create_table_sql("Agent", &fields, Some("A_AgentID"));
        assert!(sql.contains("AUTO_INCREMENT PRIMARY KEY"));
        assert!(!sql.contains("`A_AgentID`"));
    }

    #[test]
    fn comment_quotes_are_escaped() {
        let fields = vec![field("L_Remarks", "Seller's Remarks", RetsDataType::Character { max_length: None })];
        let sql = create_table_sql("Property_RE_1", &fields, None);
        assert!(sql.contains("COMMENT 'Seller''s Remarks'"));
    }

    #[test]
    fn visible_name_transform() {
        assert_eq!(visible_name("Number of Bedrooms"), "Bedrooms");
        assert_eq!(visible_name("NumberOfBathrooms"), "Bathrooms");
        assert_eq!(visible_name("Number of Pieces of Equipment"), "PiecesEquipment");
        assert_eq!(visible_name("Year Built"), "YearBuilt");
        assert_eq!(visible_name("Price / Sq. Ft."), "PriceSqFt");
        assert_eq!(visible_name("Type of Dwelling"), "TypeDwelling");
        assert_eq!(visible_name(""), "");
    }

    #[test]
    fn visible_table_uses_transformed_names_and_myisam() {
        let fields = vec![
            field("L_ListingID", "Listing ID", RetsDataType::Character { max_length: Some(10) }),
            field("LM_Int2_3", "Number of Bedrooms", RetsDataType::Int),
        ];
        let sql = create_visible_table_sql("Property_RE_1", &fields, Some("L_ListingID"));
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `Property_RE_1_visible`"));
        assert!(sql.contains("`ListingID` VARCHAR(10) PRIMARY KEY"));
        assert!(sql.contains("`Bedrooms` INT COMMENT 'LM_Int2_3'"));
        assert!(sql.trim_end().ends_with("ENGINE=MyISAM"));
    }

    #[test]
    fn empty_long_name_falls_back_to_system_name() {
        let fields = vec![field("L_Odd", "", RetsDataType::Int)];
        let sql = create_visible_table_sql("Property_RE_1", &fields, None);
        assert!(sql.contains("`L_Odd` INT"));
    }
}
