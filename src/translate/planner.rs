//! Planner interface (spec §4.2) and the WHERE-residual compiler it feeds
//! (spec §2 item 3, §4.5 step 5).

use sqlparser::ast::{BinaryOperator, Expr, OrderByExpr};

use crate::vdbe::builder::{CursorPlan, ProgramBuilder};
use crate::vdbe::CursorId;
use crate::vtab::{ConstraintOp, IndexConstraint, IndexInfo, OrderByTerm, SortDirection};
use crate::Result;

use super::from::resolve_column;
use super::plan::{JoinedTable, WhereTerm};

/// Splits a WHERE (or ON) expression into its top-level AND conjuncts (spec
/// §4.5: "AND is decomposed"). A bare non-AND expression is a single term.
pub fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        Expr::Nested(inner) => split_conjuncts(inner),
        other => vec![other.clone()],
    }
}

fn binary_op_to_constraint(op: &BinaryOperator) -> Option<ConstraintOp> {
    match op {
        BinaryOperator::Eq => Some(ConstraintOp::Eq),
        BinaryOperator::NotEq => Some(ConstraintOp::Ne),
        BinaryOperator::Gt => Some(ConstraintOp::Gt),
        BinaryOperator::GtEq => Some(ConstraintOp::Ge),
        BinaryOperator::Lt => Some(ConstraintOp::Lt),
        BinaryOperator::LtEq => Some(ConstraintOp::Le),
        _ => None,
    }
}

/// A conjunct shaped as `column <op> constant-ish-rhs` where the column
/// belongs to `cursor` and the rhs references only outer-active cursors (or
/// is a literal/parameter), i.e. is usable as a `best_index` input.
struct ExtractedConstraint {
    column: usize,
    op: ConstraintOp,
    rhs: Expr,
    usable: bool,
}

fn extract_constraint(
    term: &Expr,
    cursor: CursorId,
    tables: &[JoinedTable],
) -> Option<ExtractedConstraint> {
    match term {
        Expr::BinaryOp { left, op, right } => {
            let constraint_op = binary_op_to_constraint(op)?;
            if let Some((col_cursor, col_idx, rhs, flipped)) =
                match_column_side(left, right, cursor, tables)
            {
                let op = if flipped { flip(constraint_op) } else { constraint_op };
                let usable = !references_cursor(&rhs, col_cursor, tables);
                return Some(ExtractedConstraint {
                    column: col_idx,
                    op,
                    rhs,
                    usable,
                });
            }
            None
        }
        Expr::IsNull(inner) => column_index_of(inner, cursor, tables)
            .map(|col| ExtractedConstraint {
                column: col,
                op: ConstraintOp::IsNull,
                rhs: Expr::Value(sqlparser::ast::Value::Null),
                usable: true,
            }),
        Expr::IsNotNull(inner) => column_index_of(inner, cursor, tables)
            .map(|col| ExtractedConstraint {
                column: col,
                op: ConstraintOp::IsNotNull,
                rhs: Expr::Value(sqlparser::ast::Value::Null),
                usable: true,
            }),
        _ => None,
    }
}

fn flip(op: ConstraintOp) -> ConstraintOp {
    match op {
        ConstraintOp::Gt => ConstraintOp::Lt,
        ConstraintOp::Lt => ConstraintOp::Gt,
        ConstraintOp::Ge => ConstraintOp::Le,
        ConstraintOp::Le => ConstraintOp::Ge,
        other => other,
    }
}

fn column_index_of(expr: &Expr, cursor: CursorId, tables: &[JoinedTable]) -> Option<usize> {
    let (qualifier, name) = split_ident(expr)?;
    let (c, idx) = resolve_column(tables, qualifier.as_deref(), &name)?;
    (c == cursor).then_some(idx)
}

fn split_ident(expr: &Expr) -> Option<(Option<String>, String)> {
    match expr {
        Expr::Identifier(id) => Some((None, id.value.clone())),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => Some((
            Some(parts[parts.len() - 2].value.clone()),
            parts[parts.len() - 1].value.clone(),
        )),
        _ => None,
    }
}

/// Returns `(cursor, column_index, other_side, flipped)` if exactly one side
/// of the comparison is a column belonging to `cursor`.
fn match_column_side(
    left: &Expr,
    right: &Expr,
    cursor: CursorId,
    tables: &[JoinedTable],
) -> Option<(CursorId, usize, Expr, bool)> {
    if let Some(idx) = column_index_of(left, cursor, tables) {
        return Some((cursor, idx, right.clone(), false));
    }
    if let Some(idx) = column_index_of(right, cursor, tables) {
        return Some((cursor, idx, left.clone(), true));
    }
    None
}

fn references_cursor(expr: &Expr, cursor: CursorId, tables: &[JoinedTable]) -> bool {
    let mut found = false;
    walk_expr(expr, &mut |e| {
        if let Some((qualifier, name)) = split_ident(e) {
            if let Some((c, _)) = resolve_column(tables, qualifier.as_deref(), &name) {
                if c == cursor {
                    found = true;
                }
            }
        }
    });
    found
}

fn walk_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, f);
            walk_expr(right, f);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::Cast { expr, .. } => walk_expr(expr, f),
        _ => {}
    }
}

/// Plans every cursor in `tables`: for each, collects the WHERE-term subset
/// that references only that cursor (spec §4.2), builds an `IndexInfo`, asks
/// the vtab module for an access plan, and stores it on `program`.
pub fn plan_cursors(
    program: &mut ProgramBuilder,
    catalog: &dyn crate::catalog::Catalog,
    tables: &[JoinedTable],
    where_terms: &mut [WhereTerm],
    order_by: &[OrderByExpr],
) -> Result<()> {
    for table in tables {
        let module = catalog.get_vtab_module(&table.schema.module);

        let mut applicable: Vec<(usize, ExtractedConstraint)> = Vec::new();
        for (i, term) in where_terms.iter().enumerate() {
            if term.consumed {
                continue;
            }
            if let Some(extracted) = extract_constraint(&term.expr, table.cursor, tables) {
                applicable.push((i, extracted));
            }
        }

        let order_by_terms: Vec<OrderByTerm> = order_by
            .iter()
            .filter_map(|ob| {
                let (qualifier, name) = split_ident(&ob.expr)?;
                let (c, idx) = resolve_column(tables, qualifier.as_deref(), &name)?;
                (c == table.cursor).then_some(OrderByTerm {
                    column: idx,
                    direction: if ob.asc.unwrap_or(true) {
                        SortDirection::Asc
                    } else {
                        SortDirection::Desc
                    },
                })
            })
            .collect();

        let info = IndexInfo {
            constraints: applicable
                .iter()
                .map(|(_, c)| IndexConstraint {
                    column: c.column,
                    op: c.op,
                    usable: c.usable,
                })
                .collect(),
            order_by: order_by_terms,
            estimated_rows: None,
        };

        let plan = if let Some(module) = module {
            module.best_index(&table.schema, &info)?
        } else {
            crate::vtab::AccessPlan::full_scan(info.constraints.len(), 1_000_000)
        };

        let mut handled_nodes = Vec::new();
        let mut constraint_exprs_by_argv: Vec<(u32, Expr)> = Vec::new();
        for (usage, (term_idx, extracted)) in plan.usage.iter().zip(applicable.into_iter()) {
            if let Some(argv) = usage.argv_index {
                constraint_exprs_by_argv.push((argv, extracted.rhs.clone()));
                if usage.omit {
                    handled_nodes.push(term_idx);
                    where_terms[term_idx].consumed = true;
                }
            }
        }
        constraint_exprs_by_argv.sort_by_key(|(argv, _)| *argv);
        let constraint_exprs: Vec<Expr> = constraint_exprs_by_argv.into_iter().map(|(_, e)| e).collect();

        program.cursor_plans.insert(
            table.cursor,
            CursorPlan {
                idx_num: plan.idx_num,
                idx_str: plan.idx_str.clone(),
                usage: plan.usage.clone(),
                constraint_exprs,
                order_by_consumed: plan.order_by_consumed,
                cost: plan.estimated_cost,
                estimated_rows: plan.estimated_rows,
                handled_nodes,
            },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnFlags, ColumnSchema, TableSchema};
    use crate::value::Affinity;
    use crate::vtab::{AccessPlan, VirtualTableModule};
    use crate::StaticCatalog;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// A module whose `best_index` grants a PK-equality plan whenever it
    /// sees an `Eq` constraint on column 0, matching spec §8 scenario 1.
    struct PkEqModule;
    impl VirtualTableModule for PkEqModule {
        fn connect(&self, _: &str, _: &str, _: &[String]) -> crate::Result<TableSchema> {
            unreachable!("not used in this test")
        }
        fn best_index(&self, _table: &TableSchema, info: &IndexInfo) -> crate::Result<AccessPlan> {
            let mut usage = vec![ConstraintUsage::default(); info.constraints.len()];
            let mut idx_num = 0;
            for (i, c) in info.constraints.iter().enumerate() {
                if c.column == 0 && c.op == ConstraintOp::Eq && c.usable {
                    usage[i] = ConstraintUsage { argv_index: Some(1), omit: true };
                    idx_num = 1;
                }
            }
            Ok(AccessPlan {
                idx_num,
                idx_str: None,
                usage,
                order_by_consumed: false,
                estimated_cost: if idx_num != 0 { 1.0 } else { 1_000_000.0 },
                estimated_rows: if idx_num != 0 { 1 } else { 1_000_000 },
                explanation: None,
            })
        }
    }

    fn t_schema() -> TableSchema {
        TableSchema {
            name: "t".to_string(),
            columns: vec![
                ColumnSchema { name: "a".to_string(), affinity: Affinity::Integer, flags: ColumnFlags::PRIMARY_KEY, default: None },
                ColumnSchema { name: "b".to_string(), affinity: Affinity::Text, flags: ColumnFlags::NOT_NULL, default: None },
            ],
            primary_key: vec![0],
            indexes: vec![],
            checks: vec![],
            module: "pkeq".to_string(),
            module_args: vec![],
        }
    }

    fn catalog_with_module() -> StaticCatalog {
        let mut tables = HashMap::new();
        tables.insert("t".to_string(), Arc::new(t_schema()));
        let mut modules: HashMap<String, Arc<dyn VirtualTableModule>> = HashMap::new();
        modules.insert("pkeq".to_string(), Arc::new(PkEqModule));
        StaticCatalog { tables, functions: vec![], modules }
    }

    #[test]
    fn pk_equality_constraint_is_handled_and_omitted() {
        let catalog = catalog_with_module();
        let sql = "select a, b from t where a = 3";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default()).unwrap();
        let filter = program
            .instructions
            .iter()
            .find(|i| matches!(i, crate::vdbe::insn::Insn::VFilter { .. }))
            .expect("a VFilter must be emitted");
        if let crate::vdbe::insn::Insn::VFilter { plan, .. } = filter {
            assert_ne!(plan.idx_num, 0);
            assert_eq!(plan.n_args, 1);
        }
    }

    #[test]
    fn split_conjuncts_flattens_nested_and() {
        let sql = "select 1 from t where a = 1 and b = 2 and a = 3";
        let stmts = sqlparser::parser::Parser::parse_sql(&sqlparser::dialect::SQLiteDialect {}, sql).unwrap();
        let selection = match &stmts[0] {
            sqlparser::ast::Statement::Query(q) => match &*q.body {
                sqlparser::ast::SetExpr::Select(s) => s.selection.clone().unwrap(),
                _ => panic!(),
            },
            _ => panic!(),
        };
        assert_eq!(split_conjuncts(&selection).len(), 3);
    }
}
