//! Tree rewriting.
//!
//! Nodes are immutable once built; rewrites produce a new [`Statement`] and
//! leave the input untouched.

use super::node::*;

/// Rebuild `statement`, replacing every table reference with `f(table)`.
///
/// Foreign key targets are table references too and are mapped the same way.
pub fn map_tables<F>(statement: &Statement, f: &mut F) -> Statement
where
    F: FnMut(&TableDef) -> TableDef,
{
    match statement {
        Statement::CreateTable(s) => Statement::CreateTable(CreateTableStmt {
            name: f(&s.name),
            if_not_exists: s.if_not_exists,
            columns: s.columns.clone(),
            constraints: s
                .constraints
                .iter()
                .map(|c| map_constraint(c, f))
                .collect(),
        }),
        Statement::AlterTable(s) => Statement::AlterTable(AlterTableStmt {
            table: f(&s.table),
            alter_items: s.alter_items.iter().map(|item| map_tables(item, f)).collect(),
        }),
        Statement::AddColumnList(s) => Statement::AddColumnList(AddColumnListStmt {
            table: f(&s.table),
            columns: s.columns.clone(),
        }),
        Statement::AddConstraint(s) => Statement::AddConstraint(AddConstraintStmt {
            table: f(&s.table),
            constraint: map_constraint(&s.constraint, f),
        }),
        Statement::ChangeColumn(s) => Statement::ChangeColumn(ChangeColumnStmt {
            table: f(&s.table),
            old_name: s.old_name.clone(),
            column: s.column.clone(),
        }),
        Statement::DropConstraint(s) => Statement::DropConstraint(DropConstraintStmt {
            table: f(&s.table),
            name: s.name.clone(),
        }),
        Statement::RenameColumn(s) => Statement::RenameColumn(RenameColumnStmt {
            table: f(&s.table),
            old_name: s.old_name.clone(),
            new_name: s.new_name.clone(),
        }),
        Statement::RenameConstraint(s) => Statement::RenameConstraint(RenameConstraintStmt {
            table: f(&s.table),
            old_name: s.old_name.clone(),
            new_name: s.new_name.clone(),
        }),
        Statement::RenameTable(s) => Statement::RenameTable(RenameTableStmt {
            table: f(&s.table),
            new_name: s.new_name.clone(),
        }),
    }
}

fn map_constraint<F>(constraint: &ConstraintDef, f: &mut F) -> ConstraintDef
where
    F: FnMut(&TableDef) -> TableDef,
{
    ConstraintDef {
        name: constraint.name.clone(),
        constraint_type: constraint.constraint_type.clone(),
        columns: constraint.columns.clone(),
        foreign: constraint.foreign.as_ref().map(|foreign| ForeignDef {
            table: f(&foreign.table),
            columns: foreign.columns.clone(),
            on_delete: foreign.on_delete.clone(),
            on_update: foreign.on_update.clone(),
        }),
    }
}

/// Point every reference to `from` at `to`, keeping the schema qualifier
pub fn rename_table(statement: &Statement, from: &TableDef, to: &str) -> Statement {
    map_tables(statement, &mut |table: &TableDef| {
        if table.matches(from) {
            TableDef {
                schema: table.schema.clone(),
                name: to.to_string(),
            }
        } else {
            table.clone()
        }
    })
}

/// Qualify unqualified table references with `schema`
pub fn qualify_tables(statement: &Statement, schema: &str) -> Statement {
    map_tables(statement, &mut |table: &TableDef| match &table.schema {
        Some(_) => table.clone(),
        None => TableDef::qualified(schema, table.name.clone()),
    })
}
