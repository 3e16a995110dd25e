#[cfg(test)]
use super::source::Header;

/// A target column as it will appear in the INSERT statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: String,
    /// Server-side type the text parameter is cast to; `None` binds it bare.
    pub sql_type: Option<String>,
}

impl TargetColumn {
    #[cfg(test)]
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: None,
        }
    }

    pub fn typed(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: Some(sql_type.into()),
        }
    }
}

/// Parameterized single-row INSERT, built once per run and shared by every
/// worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    sql: String,
    params: usize,
}

impl InsertStatement {
    /// `table` is used verbatim and must already be a valid, quoted-if-needed
    /// relation name. Column names are always quoted.
    pub fn build(table: &str, columns: &[TargetColumn]) -> Self {
        let names = columns
            .iter()
            .map(|column| quote_ident(&column.name))
            .collect::<Vec<_>>()
            .join(", ");

        let values = columns
            .iter()
            .zip(placeholders(columns.len()))
            .map(|(column, placeholder)| match &column.sql_type {
                Some(sql_type) => format!("CAST({} AS {})", placeholder, sql_type),
                None => placeholder,
            })
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            sql: format!("INSERT INTO {} ({}) VALUES ({})", table, names, values),
            params: columns.len(),
        }
    }

    /// Statement with bare placeholders for every header column.
    #[cfg(test)]
    pub fn for_header(table: &str, header: &Header) -> Self {
        let columns: Vec<_> = header.columns().iter().map(TargetColumn::untyped).collect();
        Self::build(table, &columns)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params
    }
}

/// Positional placeholders `$1..=$n`.
pub fn placeholders(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("${}", i)).collect()
}

/// Double-quote an identifier, doubling any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_placeholders_follow_header_order() {
        let header = Header::new(["id", "name"]);
        let statement = InsertStatement::for_header("items", &header);

        assert_eq!(
            statement.sql(),
            r#"INSERT INTO items ("id", "name") VALUES ($1, $2)"#
        );
        assert_eq!(statement.param_count(), 2);
    }

    #[test]
    fn typed_columns_are_cast_server_side() {
        let statement = InsertStatement::build(
            "public.items",
            &[
                TargetColumn::typed("id", "integer"),
                TargetColumn::typed("created_at", "timestamp with time zone"),
                TargetColumn::untyped("note"),
            ],
        );

        assert_eq!(
            statement.sql(),
            "INSERT INTO public.items (\"id\", \"created_at\", \"note\") VALUES \
             (CAST($1 AS integer), CAST($2 AS timestamp with time zone), $3)"
        );
    }

    #[test]
    fn embedded_quotes_are_escaped() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn placeholder_count_matches() {
        assert_eq!(placeholders(0), Vec::<String>::new());
        assert_eq!(placeholders(3), ["$1", "$2", "$3"]);
    }
}
