//! Statement tree node types.
//!
//! The node set is closed: [`Statement`] owns a parsed DDL statement and
//! [`NodeRef`] is the borrowed view the walker dispatches on. Children are
//! owned values, so a tree cannot reference its own ancestors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a table, optionally schema-qualified
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableDef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Same table, ignoring the schema qualifier when either side lacks one
    pub fn matches(&self, other: &TableDef) -> bool {
        if self.name != other.name {
            return false;
        }
        match (&self.schema, &other.schema) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for TableDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "expression", rename_all = "snake_case")]
pub enum ConstraintType {
    PrimaryKey,
    Unique,
    ForeignKey,
    Check(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignDef {
    pub table: TableDef,
    pub columns: Vec<String>,
    pub on_delete: Option<String>,
    pub on_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDef {
    pub name: Option<String>,
    pub constraint_type: ConstraintType,
    pub columns: Vec<String>,
    /// Present only for foreign keys
    pub foreign: Option<ForeignDef>,
}

impl ConstraintDef {
    pub fn primary_key(name: Option<String>, columns: Vec<String>) -> Self {
        Self {
            name,
            constraint_type: ConstraintType::PrimaryKey,
            columns,
            foreign: None,
        }
    }

    pub fn unique(name: Option<String>, columns: Vec<String>) -> Self {
        Self {
            name,
            constraint_type: ConstraintType::Unique,
            columns,
            foreign: None,
        }
    }

    pub fn check(name: Option<String>, expression: impl Into<String>) -> Self {
        Self {
            name,
            constraint_type: ConstraintType::Check(expression.into()),
            columns: Vec::new(),
            foreign: None,
        }
    }

    pub fn foreign_key(name: Option<String>, columns: Vec<String>, foreign: ForeignDef) -> Self {
        Self {
            name,
            constraint_type: ConstraintType::ForeignKey,
            columns,
            foreign: Some(foreign),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTableStmt {
    pub name: TableDef,
    pub if_not_exists: bool,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<ConstraintDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterTableStmt {
    pub table: TableDef,
    pub alter_items: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddColumnListStmt {
    pub table: TableDef,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddConstraintStmt {
    pub table: TableDef,
    pub constraint: ConstraintDef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeColumnStmt {
    pub table: TableDef,
    pub old_name: String,
    pub column: ColumnDef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropConstraintStmt {
    pub table: TableDef,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameColumnStmt {
    pub table: TableDef,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameConstraintStmt {
    pub table: TableDef,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameTableStmt {
    pub table: TableDef,
    pub new_name: String,
}

/// Owned statement tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statement {
    CreateTable(CreateTableStmt),
    AlterTable(AlterTableStmt),
    AddColumnList(AddColumnListStmt),
    AddConstraint(AddConstraintStmt),
    ChangeColumn(ChangeColumnStmt),
    DropConstraint(DropConstraintStmt),
    RenameColumn(RenameColumnStmt),
    RenameConstraint(RenameConstraintStmt),
    RenameTable(RenameTableStmt),
}

impl Statement {
    pub fn as_node(&self) -> NodeRef<'_> {
        NodeRef::from(self)
    }

    /// Table the statement operates on
    pub fn table(&self) -> &TableDef {
        match self {
            Self::CreateTable(s) => &s.name,
            Self::AlterTable(s) => &s.table,
            Self::AddColumnList(s) => &s.table,
            Self::AddConstraint(s) => &s.table,
            Self::ChangeColumn(s) => &s.table,
            Self::DropConstraint(s) => &s.table,
            Self::RenameColumn(s) => &s.table,
            Self::RenameConstraint(s) => &s.table,
            Self::RenameTable(s) => &s.table,
        }
    }
}

/// Borrowed view of any node in a statement tree
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeRef<'a> {
    CreateTable(&'a CreateTableStmt),
    AlterTable(&'a AlterTableStmt),
    AddColumnList(&'a AddColumnListStmt),
    AddConstraint(&'a AddConstraintStmt),
    ChangeColumn(&'a ChangeColumnStmt),
    DropConstraint(&'a DropConstraintStmt),
    RenameColumn(&'a RenameColumnStmt),
    RenameConstraint(&'a RenameConstraintStmt),
    RenameTable(&'a RenameTableStmt),
    ColumnDef(&'a ColumnDef),
    ConstraintDef(&'a ConstraintDef),
    ForeignDef(&'a ForeignDef),
    TableDef(&'a TableDef),
}

impl<'a> From<&'a Statement> for NodeRef<'a> {
    fn from(statement: &'a Statement) -> Self {
        match statement {
            Statement::CreateTable(s) => NodeRef::CreateTable(s),
            Statement::AlterTable(s) => NodeRef::AlterTable(s),
            Statement::AddColumnList(s) => NodeRef::AddColumnList(s),
            Statement::AddConstraint(s) => NodeRef::AddConstraint(s),
            Statement::ChangeColumn(s) => NodeRef::ChangeColumn(s),
            Statement::DropConstraint(s) => NodeRef::DropConstraint(s),
            Statement::RenameColumn(s) => NodeRef::RenameColumn(s),
            Statement::RenameConstraint(s) => NodeRef::RenameConstraint(s),
            Statement::RenameTable(s) => NodeRef::RenameTable(s),
        }
    }
}

impl<'a> NodeRef<'a> {
    /// Children in traversal order.
    ///
    /// The table reference always comes first, followed by child lists in
    /// declaration order: create-table visits columns then constraints,
    /// alter-table visits its alter items, a constraint visits its foreign
    /// key definition. Column and table definitions are leaves.
    pub fn children(&self) -> Vec<NodeRef<'a>> {
        match *self {
            NodeRef::CreateTable(s) => {
                let mut children = Vec::with_capacity(1 + s.columns.len() + s.constraints.len());
                children.push(NodeRef::TableDef(&s.name));
                children.extend(s.columns.iter().map(NodeRef::ColumnDef));
                children.extend(s.constraints.iter().map(NodeRef::ConstraintDef));
                children
            }
            NodeRef::AlterTable(s) => {
                let mut children = Vec::with_capacity(1 + s.alter_items.len());
                children.push(NodeRef::TableDef(&s.table));
                children.extend(s.alter_items.iter().map(NodeRef::from));
                children
            }
            NodeRef::AddColumnList(s) => {
                let mut children = Vec::with_capacity(1 + s.columns.len());
                children.push(NodeRef::TableDef(&s.table));
                children.extend(s.columns.iter().map(NodeRef::ColumnDef));
                children
            }
            NodeRef::AddConstraint(s) => vec![
                NodeRef::TableDef(&s.table),
                NodeRef::ConstraintDef(&s.constraint),
            ],
            NodeRef::ChangeColumn(s) => {
                vec![NodeRef::TableDef(&s.table), NodeRef::ColumnDef(&s.column)]
            }
            NodeRef::DropConstraint(s) => vec![NodeRef::TableDef(&s.table)],
            NodeRef::RenameColumn(s) => vec![NodeRef::TableDef(&s.table)],
            NodeRef::RenameConstraint(s) => vec![NodeRef::TableDef(&s.table)],
            NodeRef::RenameTable(s) => vec![NodeRef::TableDef(&s.table)],
            NodeRef::ConstraintDef(c) => c.foreign.iter().map(NodeRef::ForeignDef).collect(),
            NodeRef::ForeignDef(f) => vec![NodeRef::TableDef(&f.table)],
            NodeRef::ColumnDef(_) | NodeRef::TableDef(_) => Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeRef::ColumnDef(_) | NodeRef::TableDef(_))
    }

    /// Stable node kind name for logs and diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            NodeRef::CreateTable(_) => "create_table",
            NodeRef::AlterTable(_) => "alter_table",
            NodeRef::AddColumnList(_) => "add_column_list",
            NodeRef::AddConstraint(_) => "add_constraint",
            NodeRef::ChangeColumn(_) => "change_column",
            NodeRef::DropConstraint(_) => "drop_constraint",
            NodeRef::RenameColumn(_) => "rename_column",
            NodeRef::RenameConstraint(_) => "rename_constraint",
            NodeRef::RenameTable(_) => "rename_table",
            NodeRef::ColumnDef(_) => "column_def",
            NodeRef::ConstraintDef(_) => "constraint_def",
            NodeRef::ForeignDef(_) => "foreign_def",
            NodeRef::TableDef(_) => "table_def",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_children_order() {
        let stmt = CreateTableStmt {
            name: TableDef::new("users"),
            if_not_exists: false,
            columns: vec![ColumnDef::new("id", "bigint"), ColumnDef::new("email", "text")],
            constraints: vec![ConstraintDef::primary_key(None, vec!["id".into()])],
        };
        let kinds: Vec<&str> = NodeRef::CreateTable(&stmt)
            .children()
            .iter()
            .map(NodeRef::kind)
            .collect();
        assert_eq!(
            kinds,
            vec!["table_def", "column_def", "column_def", "constraint_def"]
        );
    }

    #[test]
    fn test_leaves_have_no_children() {
        let column = ColumnDef::new("id", "bigint");
        let table = TableDef::new("t");
        assert!(NodeRef::ColumnDef(&column).children().is_empty());
        assert!(NodeRef::TableDef(&table).children().is_empty());
        assert!(NodeRef::TableDef(&table).is_leaf());
    }

    #[test]
    fn test_constraint_without_foreign_is_childless() {
        let constraint = ConstraintDef::unique(Some("uq".into()), vec!["email".into()]);
        assert!(NodeRef::ConstraintDef(&constraint).children().is_empty());
    }

    #[test]
    fn test_table_matching_ignores_missing_schema() {
        let bare = TableDef::new("orders");
        let qualified = TableDef::qualified("public", "orders");
        let other = TableDef::qualified("audit", "orders");
        assert!(bare.matches(&qualified));
        assert!(!qualified.matches(&other));
        assert_eq!(qualified.to_string(), "public.orders");
    }
}
