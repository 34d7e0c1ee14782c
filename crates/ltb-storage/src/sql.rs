//! Parameterized statements for the two query shapes the bridge issues:
//! a single-table projection and a keyed single-table update.

use ltb_core::TableId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub table: TableId,
    pub columns: Vec<String>,
    pub distinct: bool,
}

impl SelectQuery {
    /// Projection over `columns`, with repeated names collapsed.
    pub fn new<I, S>(table: TableId, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for column in columns {
            let column: String = column.into();
            if !unique.iter().any(|c| c.eq_ignore_ascii_case(&column)) {
                unique.push(column);
            }
        }
        Self {
            table,
            columns: unique,
            distinct: false,
        }
    }

    pub fn distinct_values(table: TableId, column: impl Into<String>) -> Self {
        let column: String = column.into();
        Self {
            distinct: true,
            ..Self::new(table, [column])
        }
    }
}

/// `UPDATE table SET a = ?, b = ? WHERE key_column = ?`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub table: TableId,
    pub assignments: Vec<(String, JsonValue)>,
    pub key_column: String,
    pub key_value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectQuery),
    Update(UpdateStatement),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryParam {
    pub name: String,
    pub value: JsonValue,
}

/// SQL text plus named parameters, ready for a remote driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

pub fn quote_identifier(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

pub fn quote_table(table: &TableId) -> String {
    [&table.project, &table.dataset, &table.table]
        .iter()
        .map(|part| quote_identifier(part))
        .collect::<Vec<_>>()
        .join(".")
}

impl Statement {
    pub fn table(&self) -> &TableId {
        match self {
            Statement::Select(q) => &q.table,
            Statement::Update(u) => &u.table,
        }
    }

    pub fn render(&self) -> RenderedQuery {
        match self {
            Statement::Select(q) => {
                let columns = q
                    .columns
                    .iter()
                    .map(|c| quote_identifier(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let distinct = if q.distinct { "DISTINCT " } else { "" };
                RenderedQuery {
                    sql: format!("SELECT {distinct}{columns} FROM {}", quote_table(&q.table)),
                    params: Vec::new(),
                }
            }
            Statement::Update(u) => {
                let mut params = Vec::with_capacity(u.assignments.len() + 1);
                let mut sets = Vec::with_capacity(u.assignments.len());
                for (column, value) in &u.assignments {
                    let name = format!("p{}", params.len());
                    sets.push(format!("{} = @{name}", quote_identifier(column)));
                    params.push(QueryParam {
                        name,
                        value: value.clone(),
                    });
                }
                let key_param = format!("p{}", params.len());
                params.push(QueryParam {
                    name: key_param.clone(),
                    value: u.key_value.clone(),
                });
                RenderedQuery {
                    sql: format!(
                        "UPDATE {} SET {} WHERE {} = @{key_param}",
                        quote_table(&u.table),
                        sets.join(", "),
                        quote_identifier(&u.key_column)
                    ),
                    params,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> TableId {
        TableId::new("proj", "vision", "frames")
    }

    #[test]
    fn identifiers_are_backtick_quoted_and_escaped() {
        assert_eq!(quote_identifier("row_data"), "`row_data`");
        assert_eq!(quote_identifier("we`ird"), "`we\\`ird`");
        assert_eq!(quote_identifier("back\\slash"), "`back\\\\slash`");
        assert_eq!(quote_table(&table()), "`proj`.`vision`.`frames`");
    }

    #[test]
    fn select_renders_each_column_once() {
        let query = Statement::Select(SelectQuery::new(
            table(),
            ["row_data", "global_key", "row_data", "weather"],
        ));
        assert_eq!(
            query.render().sql,
            "SELECT `row_data`, `global_key`, `weather` FROM `proj`.`vision`.`frames`"
        );
    }

    #[test]
    fn distinct_select_renders_distinct() {
        let query = Statement::Select(SelectQuery::distinct_values(table(), "weather"));
        assert_eq!(
            query.render().sql,
            "SELECT DISTINCT `weather` FROM `proj`.`vision`.`frames`"
        );
    }

    #[test]
    fn update_values_travel_as_parameters() {
        let update = Statement::Update(UpdateStatement {
            table: table(),
            assignments: vec![
                ("weather".into(), json!("rain\"; DROP TABLE x; --")),
                ("score".into(), json!("0.5")),
            ],
            key_column: "global_key".into(),
            key_value: json!("frame-1"),
        });
        let rendered = update.render();
        assert_eq!(
            rendered.sql,
            "UPDATE `proj`.`vision`.`frames` SET `weather` = @p0, `score` = @p1 WHERE `global_key` = @p2"
        );
        assert_eq!(rendered.params.len(), 3);
        assert_eq!(rendered.params[0].value, json!("rain\"; DROP TABLE x; --"));
        assert_eq!(rendered.params[2].name, "p2");
    }
}
