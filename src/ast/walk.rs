//! Generic statement tree traversal.
//!
//! [`walk`] is the only place that decides traversal order; node types carry
//! no traversal logic of their own beyond [`NodeRef::children`].

use super::node::NodeRef;

/// Callback invoked for every node reached by [`walk`].
///
/// Returning `Some(visitor)` descends into the node's children with that
/// visitor (usually `self`); returning `None` skips the whole subtree.
pub trait Visitor {
    fn visit(&mut self, node: NodeRef<'_>) -> Option<&mut dyn Visitor>;
}

/// Depth-first, pre-order walk of `node` and its descendants
pub fn walk(visitor: &mut dyn Visitor, node: NodeRef<'_>) {
    let Some(next) = visitor.visit(node) else {
        return;
    };
    for child in node.children() {
        walk(&mut *next, child);
    }
}

/// Closure-backed visitor: the closure returns `false` to prune a subtree
pub struct Inspector<F>(pub F);

impl<F> Visitor for Inspector<F>
where
    F: FnMut(NodeRef<'_>) -> bool,
{
    fn visit(&mut self, node: NodeRef<'_>) -> Option<&mut dyn Visitor> {
        if (self.0)(node) {
            Some(self)
        } else {
            None
        }
    }
}

/// Walk `node` calling `f` on each node; `f` returns `false` to skip children
pub fn inspect<F>(node: NodeRef<'_>, f: F)
where
    F: FnMut(NodeRef<'_>) -> bool,
{
    let mut inspector = Inspector(f);
    walk(&mut inspector, node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::node::*;

    fn sample_alter() -> Statement {
        Statement::AlterTable(AlterTableStmt {
            table: TableDef::new("orders"),
            alter_items: vec![
                Statement::AddColumnList(AddColumnListStmt {
                    table: TableDef::new("orders"),
                    columns: vec![ColumnDef::new("note", "text")],
                }),
                Statement::AddConstraint(AddConstraintStmt {
                    table: TableDef::new("orders"),
                    constraint: ConstraintDef::foreign_key(
                        Some("fk_customer".into()),
                        vec!["customer_id".into()],
                        ForeignDef {
                            table: TableDef::new("customers"),
                            columns: vec!["id".into()],
                            on_delete: None,
                            on_update: None,
                        },
                    ),
                }),
            ],
        })
    }

    struct Recorder {
        seen: Vec<&'static str>,
        prune: Option<&'static str>,
    }

    impl Visitor for Recorder {
        fn visit(&mut self, node: NodeRef<'_>) -> Option<&mut dyn Visitor> {
            self.seen.push(node.kind());
            if Some(node.kind()) == self.prune {
                return None;
            }
            Some(self)
        }
    }

    #[test]
    fn test_walk_visits_in_declared_order() {
        let stmt = sample_alter();
        let mut recorder = Recorder {
            seen: Vec::new(),
            prune: None,
        };
        walk(&mut recorder, stmt.as_node());
        assert_eq!(
            recorder.seen,
            vec![
                "alter_table",
                "table_def",
                "add_column_list",
                "table_def",
                "column_def",
                "add_constraint",
                "table_def",
                "constraint_def",
                "foreign_def",
                "table_def",
            ]
        );
    }

    #[test]
    fn test_pruning_skips_subtree() {
        let stmt = sample_alter();
        let mut recorder = Recorder {
            seen: Vec::new(),
            prune: Some("add_constraint"),
        };
        walk(&mut recorder, stmt.as_node());
        assert_eq!(recorder.seen.last(), Some(&"add_constraint"));
        assert!(!recorder.seen.contains(&"foreign_def"));
    }

    #[test]
    fn test_pruning_root_visits_only_root() {
        let stmt = sample_alter();
        let mut recorder = Recorder {
            seen: Vec::new(),
            prune: Some("alter_table"),
        };
        walk(&mut recorder, stmt.as_node());
        assert_eq!(recorder.seen, vec!["alter_table"]);
    }

    #[test]
    fn test_inspect_closure() {
        let stmt = sample_alter();
        let mut columns = Vec::new();
        inspect(stmt.as_node(), |node| {
            if let NodeRef::ColumnDef(column) = node {
                columns.push(column.name.clone());
            }
            true
        });
        assert_eq!(columns, vec!["note".to_string()]);
    }
}
