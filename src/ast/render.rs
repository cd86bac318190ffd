//! DDL rendering of statement trees.
//!
//! Produces engine-native statement text (without the trailing `;`). Used by
//! dumps to turn introspected schemas back into replayable DDL.

use super::node::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    ClickHouse,
}

impl Dialect {
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::ClickHouse => format!("`{}`", ident.replace('`', "``")),
        }
    }

    pub fn quote_table(&self, table: &TableDef) -> String {
        match &table.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_ident(schema),
                self.quote_ident(&table.name)
            ),
            None => self.quote_ident(&table.name),
        }
    }

    fn quote_list(&self, idents: &[String]) -> String {
        idents
            .iter()
            .map(|i| self.quote_ident(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Render a statement as one or more engine statements.
///
/// Most statements render to exactly one; alter-table items that the engine
/// cannot combine in a single `ALTER TABLE` (renames) become separate statements.
pub fn render(statement: &Statement, dialect: Dialect) -> Vec<String> {
    match statement {
        Statement::CreateTable(s) => vec![render_create_table(s, dialect)],
        Statement::AlterTable(s) => render_alter_table(&s.table, &s.alter_items, dialect),
        other => render_alter_table(other.table(), std::slice::from_ref(other), dialect),
    }
}

fn render_create_table(stmt: &CreateTableStmt, dialect: Dialect) -> String {
    let mut lines: Vec<String> = stmt
        .columns
        .iter()
        .map(|c| format!("  {}", render_column(c, dialect)))
        .collect();

    let mut order_by: Option<Vec<String>> = None;
    for constraint in &stmt.constraints {
        match dialect {
            Dialect::Postgres => lines.push(format!("  {}", render_constraint(constraint, dialect))),
            Dialect::ClickHouse => match &constraint.constraint_type {
                ConstraintType::PrimaryKey => order_by = Some(constraint.columns.clone()),
                ConstraintType::Check(_) => {
                    lines.push(format!("  {}", render_constraint(constraint, dialect)))
                }
                // not enforced by the engine
                ConstraintType::Unique | ConstraintType::ForeignKey => {}
            },
        }
    }

    let if_not_exists = if stmt.if_not_exists { "IF NOT EXISTS " } else { "" };
    let mut sql = format!(
        "CREATE TABLE {if_not_exists}{} (\n{}\n)",
        dialect.quote_table(&stmt.name),
        lines.join(",\n")
    );
    if dialect == Dialect::ClickHouse {
        let order = match order_by {
            Some(columns) if !columns.is_empty() => format!("({})", dialect.quote_list(&columns)),
            _ => "tuple()".to_string(),
        };
        sql.push_str(&format!("\nENGINE = MergeTree\nORDER BY {order}"));
    }
    sql
}

fn render_column(column: &ColumnDef, dialect: Dialect) -> String {
    let mut sql = format!("{} {}", dialect.quote_ident(&column.name), column.data_type);
    if let Some(default) = &column.default {
        sql.push_str(&format!(" DEFAULT {default}"));
    }
    if !column.nullable && dialect == Dialect::Postgres {
        sql.push_str(" NOT NULL");
    }
    sql
}

fn render_constraint(constraint: &ConstraintDef, dialect: Dialect) -> String {
    let mut sql = String::new();
    if let Some(name) = &constraint.name {
        sql.push_str(&format!("CONSTRAINT {} ", dialect.quote_ident(name)));
    }
    match &constraint.constraint_type {
        ConstraintType::PrimaryKey => {
            sql.push_str(&format!("PRIMARY KEY ({})", dialect.quote_list(&constraint.columns)))
        }
        ConstraintType::Unique => {
            sql.push_str(&format!("UNIQUE ({})", dialect.quote_list(&constraint.columns)))
        }
        ConstraintType::Check(expression) => sql.push_str(&format!("CHECK ({expression})")),
        ConstraintType::ForeignKey => {
            sql.push_str(&format!(
                "FOREIGN KEY ({})",
                dialect.quote_list(&constraint.columns)
            ));
            if let Some(foreign) = &constraint.foreign {
                sql.push_str(&format!(
                    " REFERENCES {} ({})",
                    dialect.quote_table(&foreign.table),
                    dialect.quote_list(&foreign.columns)
                ));
                if let Some(action) = &foreign.on_delete {
                    sql.push_str(&format!(" ON DELETE {action}"));
                }
                if let Some(action) = &foreign.on_update {
                    sql.push_str(&format!(" ON UPDATE {action}"));
                }
            }
        }
    }
    sql
}

fn render_alter_table(table: &TableDef, items: &[Statement], dialect: Dialect) -> Vec<String> {
    let target = dialect.quote_table(table);
    let mut statements = Vec::new();
    let mut clauses = Vec::new();

    for item in items {
        match item {
            Statement::AddColumnList(s) => {
                for column in &s.columns {
                    clauses.push(format!("ADD COLUMN {}", render_column(column, dialect)));
                }
            }
            Statement::AddConstraint(s) => {
                clauses.push(format!("ADD {}", render_constraint(&s.constraint, dialect)));
            }
            Statement::DropConstraint(s) => {
                clauses.push(format!("DROP CONSTRAINT {}", dialect.quote_ident(&s.name)));
            }
            Statement::ChangeColumn(s) => {
                if s.old_name != s.column.name {
                    statements.push(format!(
                        "ALTER TABLE {target} RENAME COLUMN {} TO {}",
                        dialect.quote_ident(&s.old_name),
                        dialect.quote_ident(&s.column.name)
                    ));
                }
                let column = dialect.quote_ident(&s.column.name);
                match dialect {
                    Dialect::Postgres => {
                        clauses.push(format!("ALTER COLUMN {column} TYPE {}", s.column.data_type));
                        clauses.push(if s.column.nullable {
                            format!("ALTER COLUMN {column} DROP NOT NULL")
                        } else {
                            format!("ALTER COLUMN {column} SET NOT NULL")
                        });
                        clauses.push(match &s.column.default {
                            Some(default) => format!("ALTER COLUMN {column} SET DEFAULT {default}"),
                            None => format!("ALTER COLUMN {column} DROP DEFAULT"),
                        });
                    }
                    Dialect::ClickHouse => {
                        clauses.push(format!("MODIFY COLUMN {}", render_column(&s.column, dialect)));
                    }
                }
            }
            Statement::RenameColumn(s) => statements.push(format!(
                "ALTER TABLE {target} RENAME COLUMN {} TO {}",
                dialect.quote_ident(&s.old_name),
                dialect.quote_ident(&s.new_name)
            )),
            Statement::RenameConstraint(s) => statements.push(format!(
                "ALTER TABLE {target} RENAME CONSTRAINT {} TO {}",
                dialect.quote_ident(&s.old_name),
                dialect.quote_ident(&s.new_name)
            )),
            Statement::RenameTable(s) => statements.push(match dialect {
                Dialect::Postgres => format!(
                    "ALTER TABLE {target} RENAME TO {}",
                    dialect.quote_ident(&s.new_name)
                ),
                Dialect::ClickHouse => {
                    let renamed = TableDef {
                        schema: s.table.schema.clone(),
                        name: s.new_name.clone(),
                    };
                    format!("RENAME TABLE {target} TO {}", dialect.quote_table(&renamed))
                }
            }),
            Statement::AlterTable(nested) => {
                statements.extend(render_alter_table(&nested.table, &nested.alter_items, dialect));
            }
            Statement::CreateTable(create) => statements.push(render_create_table(create, dialect)),
        }
    }

    if !clauses.is_empty() {
        statements.insert(0, format!("ALTER TABLE {target} {}", clauses.join(", ")));
    }
    statements
}
