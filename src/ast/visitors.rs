//! Reusable visitors: table collection and node counting.

use super::node::{NodeRef, TableDef};
use super::walk::{walk, Visitor};
use std::collections::BTreeMap;

/// Collects every table referenced by a tree, in first-seen order, without duplicates.
///
/// Foreign key targets are included unless `skip_foreign_targets` is set.
#[derive(Debug, Default)]
pub struct TableCollector {
    tables: Vec<TableDef>,
    skip_foreign_targets: bool,
}

impl TableCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only tables the statements operate on, not the tables they reference
    pub fn without_foreign_targets() -> Self {
        Self {
            tables: Vec::new(),
            skip_foreign_targets: true,
        }
    }

    pub fn collect(mut self, node: NodeRef<'_>) -> Vec<TableDef> {
        walk(&mut self, node);
        self.tables
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }
}

impl Visitor for TableCollector {
    fn visit(&mut self, node: NodeRef<'_>) -> Option<&mut dyn Visitor> {
        match node {
            NodeRef::ForeignDef(_) if self.skip_foreign_targets => return None,
            NodeRef::TableDef(table) => {
                if !self.tables.contains(table) {
                    self.tables.push(table.clone());
                }
            }
            _ => {}
        }
        Some(self)
    }
}

/// Counts nodes by kind
#[derive(Debug, Default)]
pub struct NodeCounter {
    counts: BTreeMap<&'static str, usize>,
}

impl NodeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.counts.get(kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn counts(&self) -> &BTreeMap<&'static str, usize> {
        &self.counts
    }
}

impl Visitor for NodeCounter {
    fn visit(&mut self, node: NodeRef<'_>) -> Option<&mut dyn Visitor> {
        *self.counts.entry(node.kind()).or_default() += 1;
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::node::*;

    fn create_orders() -> Statement {
        Statement::CreateTable(CreateTableStmt {
            name: TableDef::new("orders"),
            if_not_exists: true,
            columns: vec![
                ColumnDef::new("id", "bigint").not_null(),
                ColumnDef::new("customer_id", "bigint"),
            ],
            constraints: vec![
                ConstraintDef::primary_key(None, vec!["id".into()]),
                ConstraintDef::foreign_key(
                    None,
                    vec!["customer_id".into()],
                    ForeignDef {
                        table: TableDef::new("customers"),
                        columns: vec!["id".into()],
                        on_delete: Some("CASCADE".into()),
                        on_update: None,
                    },
                ),
            ],
        })
    }

    #[test]
    fn test_collects_tables_including_foreign_targets() {
        let stmt = create_orders();
        let tables = TableCollector::new().collect(stmt.as_node());
        assert_eq!(
            tables,
            vec![TableDef::new("orders"), TableDef::new("customers")]
        );
    }

    #[test]
    fn test_collects_tables_without_foreign_targets() {
        let stmt = create_orders();
        let tables = TableCollector::without_foreign_targets().collect(stmt.as_node());
        assert_eq!(tables, vec![TableDef::new("orders")]);
    }

    #[test]
    fn test_counter_visits_every_node_once() {
        let stmt = create_orders();
        let mut counter = NodeCounter::new();
        walk(&mut counter, stmt.as_node());
        assert_eq!(counter.count("create_table"), 1);
        assert_eq!(counter.count("column_def"), 2);
        assert_eq!(counter.count("constraint_def"), 2);
        assert_eq!(counter.count("foreign_def"), 1);
        assert_eq!(counter.count("table_def"), 2);
        assert_eq!(counter.total(), 8);
    }
}
