use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Role;

    #[test]
    fn parse_enum_reports_column() {
        let err = parse_enum::<Role>("system", "conversation_memory", "role").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("conversation_memory.role"), "{msg}");
        assert!(msg.contains("system"), "{msg}");
    }

    #[test]
    fn get_maps_type_errors() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let result = conn.query_row("SELECT 'abc'", [], |row| {
            Ok(get::<i64>(row, 0, "t", "c"))
        });
        assert!(matches!(
            result.unwrap(),
            Err(StoreError::CorruptRow { table: "t", column: "c", .. })
        ));
    }
}
