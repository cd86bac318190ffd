//! Statement validation against a known table catalog.
//!
//! [`SchemaValidator`] applies statements in order to an in-memory catalog,
//! so a batch may create a table and alter it afterwards. Problems are
//! collected rather than short-circuited so a review shows all of them.

use super::node::*;
use super::visitors::TableCollector;
use crate::error::{Result, SchemaflowError};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub table: TableDef,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.table, self.message)
    }
}

#[derive(Debug, Clone)]
struct CatalogTable {
    table: TableDef,
    columns: Vec<String>,
    constraints: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SchemaValidator {
    tables: Vec<CatalogTable>,
    issues: Vec<ValidationIssue>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing table with its column and constraint names
    pub fn with_table(
        mut self,
        table: TableDef,
        columns: impl IntoIterator<Item = String>,
        constraints: impl IntoIterator<Item = String>,
    ) -> Self {
        self.tables.push(CatalogTable {
            table,
            columns: columns.into_iter().collect(),
            constraints: constraints.into_iter().collect(),
        });
        self
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn has_table(&self, table: &TableDef) -> bool {
        self.find(table).is_some()
    }

    /// Check every statement; returns a `Validation` error listing all issues
    pub fn validate(mut self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            self.apply(statement);
        }
        if self.issues.is_empty() {
            return Ok(());
        }
        let summary = self
            .issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(SchemaflowError::Validation(summary))
    }

    pub fn apply(&mut self, statement: &Statement) {
        match statement {
            Statement::CreateTable(s) => self.create_table(s),
            Statement::AlterTable(s) => {
                if self.require(&s.table) {
                    for item in &s.alter_items {
                        if !item.table().matches(&s.table) {
                            self.issue(item.table(), "alter item targets a different table");
                            continue;
                        }
                        self.apply(item);
                    }
                }
            }
            Statement::AddColumnList(s) => {
                let Some(index) = self.require_index(&s.table) else {
                    return;
                };
                for column in &s.columns {
                    if self.tables[index].columns.contains(&column.name) {
                        self.issue(&s.table, format!("column {} already exists", column.name));
                    } else {
                        self.tables[index].columns.push(column.name.clone());
                    }
                }
            }
            Statement::AddConstraint(s) => {
                let Some(index) = self.require_index(&s.table) else {
                    return;
                };
                self.check_constraint(index, &s.table, &s.constraint);
                if let Some(name) = &s.constraint.name {
                    if self.tables[index].constraints.contains(name) {
                        self.issue(&s.table, format!("constraint {name} already exists"));
                    } else {
                        self.tables[index].constraints.push(name.clone());
                    }
                }
            }
            Statement::ChangeColumn(s) => {
                let Some(index) = self.require_index(&s.table) else {
                    return;
                };
                let columns = &mut self.tables[index].columns;
                match columns.iter().position(|c| c == &s.old_name) {
                    Some(pos) => columns[pos] = s.column.name.clone(),
                    None => self.issue(&s.table, format!("column {} does not exist", s.old_name)),
                }
            }
            Statement::DropConstraint(s) => {
                let Some(index) = self.require_index(&s.table) else {
                    return;
                };
                let constraints = &mut self.tables[index].constraints;
                match constraints.iter().position(|c| c == &s.name) {
                    Some(pos) => {
                        constraints.remove(pos);
                    }
                    None => self.issue(&s.table, format!("constraint {} does not exist", s.name)),
                }
            }
            Statement::RenameColumn(s) => {
                let Some(index) = self.require_index(&s.table) else {
                    return;
                };
                let columns = &mut self.tables[index].columns;
                if columns.contains(&s.new_name) {
                    self.issue(&s.table, format!("column {} already exists", s.new_name));
                    return;
                }
                match columns.iter().position(|c| c == &s.old_name) {
                    Some(pos) => columns[pos] = s.new_name.clone(),
                    None => self.issue(&s.table, format!("column {} does not exist", s.old_name)),
                }
            }
            Statement::RenameConstraint(s) => {
                let Some(index) = self.require_index(&s.table) else {
                    return;
                };
                let constraints = &mut self.tables[index].constraints;
                match constraints.iter().position(|c| c == &s.old_name) {
                    Some(pos) => constraints[pos] = s.new_name.clone(),
                    None => {
                        self.issue(&s.table, format!("constraint {} does not exist", s.old_name))
                    }
                }
            }
            Statement::RenameTable(s) => {
                let Some(index) = self.require_index(&s.table) else {
                    return;
                };
                let renamed = TableDef {
                    schema: self.tables[index].table.schema.clone(),
                    name: s.new_name.clone(),
                };
                if self.has_table(&renamed) {
                    self.issue(&renamed, "table already exists");
                    return;
                }
                self.tables[index].table = renamed;
            }
        }
    }

    fn create_table(&mut self, stmt: &CreateTableStmt) {
        if self.has_table(&stmt.name) {
            if !stmt.if_not_exists {
                self.issue(&stmt.name, "table already exists");
            }
            return;
        }

        let mut columns: Vec<String> = Vec::with_capacity(stmt.columns.len());
        for column in &stmt.columns {
            if columns.contains(&column.name) {
                self.issue(&stmt.name, format!("duplicate column {}", column.name));
            } else {
                columns.push(column.name.clone());
            }
        }
        self.tables.push(CatalogTable {
            table: stmt.name.clone(),
            columns,
            constraints: stmt.constraints.iter().filter_map(|c| c.name.clone()).collect(),
        });

        let index = self.tables.len() - 1;
        for constraint in &stmt.constraints {
            self.check_constraint(index, &stmt.name, constraint);
        }
    }

    fn check_constraint(&mut self, index: usize, table: &TableDef, constraint: &ConstraintDef) {
        for column in &constraint.columns {
            if !self.tables[index].columns.contains(column) {
                self.issue(table, format!("constraint references unknown column {column}"));
            }
        }

        // Self-referencing foreign keys resolve against the table being checked.
        let referenced = TableCollector::new().collect(NodeRef::ConstraintDef(constraint));
        for target in referenced {
            if !self.has_table(&target) {
                self.issue(table, format!("foreign key references unknown table {target}"));
            }
        }
    }

    fn find(&self, table: &TableDef) -> Option<usize> {
        self.tables.iter().position(|t| t.table.matches(table))
    }

    fn require(&mut self, table: &TableDef) -> bool {
        self.require_index(table).is_some()
    }

    fn require_index(&mut self, table: &TableDef) -> Option<usize> {
        let index = self.find(table);
        if index.is_none() {
            self.issue(table, "table does not exist");
        }
        index
    }

    fn issue(&mut self, table: &TableDef, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            table: table.clone(),
            message: message.into(),
        });
    }
}
