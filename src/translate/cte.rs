//! Common table expressions (spec §4.9): materialized non-recursive CTEs and
//! recursive `UNION`/`UNION ALL` CTEs.
//!
//! Both forms populate an ephemeral cursor and register it in `cte_map` so
//! `from::bind_one` binds later references to the cursor instead of opening a
//! real table. The entry (and the cursor it names) is torn down by the
//! caller (`select::translate_query`) once the statement that introduced the
//! `WITH` clause has finished reading from it.

use std::sync::Arc;

use sqlparser::ast::{
    Query, SelectItem, SetExpr, SetOperator, SetQuantifier, TableFactor, With,
};

use crate::catalog::Catalog;
use crate::vdbe::builder::{CteEntry, CursorKind, PlaceholderPurpose, ProgramBuilder};
use crate::vdbe::insn::{ConflictMode, Insn, VFilterPlan};
use crate::vdbe::Addr;
use crate::{bail_parse_error, CompileOptions, Result};

use super::expr::{translate_expr, ExprCtx};
use super::plan::{JoinConstraint, JoinKind, JoinedTable, TableSource, WhereTerm};
use super::planner::split_conjuncts;
use super::select::{insert_row, materialize_arm};

/// Compiles every CTE in a `WITH` clause, returning the (lowercased) names
/// registered in `program.cte_map` so the caller can remove them, and close
/// their cursors, once it is done reading from them.
pub fn translate_with(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    with: &With,
    options: &CompileOptions,
) -> Result<Vec<String>> {
    let mut registered = Vec::new();
    for cte in &with.cte_tables {
        let name = cte.alias.name.value.to_ascii_lowercase();
        match recursive_shape(&cte.query.body, &name) {
            Some((all, left, right)) => {
                if !with.recursive {
                    bail_parse_error!(
                        "recursive reference to '{name}' requires WITH RECURSIVE"
                    );
                }
                compile_recursive(program, catalog, &name, all, left, right, &cte.alias.columns)?;
            }
            None => compile_materialized(program, catalog, &name, &cte.query, options, &cte.alias.columns)?,
        }
        registered.push(name);
    }
    Ok(registered)
}

// ---------------------------------------------------------------------
// Non-recursive materialization
// ---------------------------------------------------------------------

fn compile_materialized(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    name: &str,
    query: &Query,
    _options: &CompileOptions,
    alias_columns: &[sqlparser::ast::TableAliasColumnDef],
) -> Result<()> {
    let mut schema = super::select::infer_schema_from_set_expr(catalog, &query.body, name)?;
    super::select::apply_column_aliases(&mut schema, alias_columns)?;
    let schema = Arc::new(schema);
    let ncols = schema.columns.len();

    let cursor = program.allocate_cursor();
    program.table_schemas.insert(cursor, CursorKind::CteRef(schema.clone()));
    program.emit(Insn::OpenEphemeral {
        cursor_id: cursor,
        num_columns: ncols,
        primary_key: vec![],
        conflict: ConflictMode::Abort,
    });
    program.mark_cursor_opened(cursor);

    // Registered before materializing so a later CTE in the same `WITH`
    // clause may already reference this one (spec §4.5 "the CTE map is
    // checked first").
    program.cte_map.insert(
        name.to_string(),
        CteEntry {
            cursor,
            schema: schema.clone(),
            recursive: false,
        },
    );

    materialize_arm(program, catalog, &query.body, cursor, ncols, ConflictMode::Abort)
}

// ---------------------------------------------------------------------
// Recursive detection
// ---------------------------------------------------------------------

/// If `body` is a top-level `UNION`/`UNION ALL` whose right arm references
/// `name` in its own FROM clause, returns `(is_all, anchor, recursive_term)`.
fn recursive_shape<'q>(body: &'q SetExpr, name: &str) -> Option<(bool, &'q SetExpr, &'q SetExpr)> {
    match body {
        SetExpr::Query(inner) => recursive_shape(&inner.body, name),
        SetExpr::SetOperation {
            op: SetOperator::Union,
            set_quantifier,
            left,
            right,
        } if references_self(right, name) => {
            Some((matches!(set_quantifier, SetQuantifier::All), left.as_ref(), right.as_ref()))
        }
        _ => None,
    }
}

fn references_self(body: &SetExpr, name: &str) -> bool {
    match body {
        SetExpr::Select(s) => s.from.iter().any(|twj| {
            factor_refs(&twj.relation, name) || twj.joins.iter().any(|j| factor_refs(&j.relation, name))
        }),
        SetExpr::Query(q) => references_self(&q.body, name),
        SetExpr::SetOperation { left, right, .. } => references_self(left, name) || references_self(right, name),
        _ => false,
    }
}

fn factor_refs(tf: &TableFactor, name: &str) -> bool {
    match tf {
        TableFactor::Table { name: n, .. } => n.to_string().eq_ignore_ascii_case(name),
        TableFactor::NestedJoin { table_with_joins, .. } => {
            factor_refs(&table_with_joins.relation, name)
                || table_with_joins.joins.iter().any(|j| factor_refs(&j.relation, name))
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------
// Recursive compilation
// ---------------------------------------------------------------------

/// Compiles a recursive CTE as a FIFO: `queue` is a strictly-appended
/// ephemeral table and a register tracks the next unread rowid, so rows
/// enqueued by the recursive term during this same pass are naturally
/// visited later without needing a second "next generation" buffer (spec
/// §4.9's "queue" is realized here as one growing table plus a read cursor,
/// rather than two alternating tables; see DESIGN.md).
///
/// Only a recursive term shaped as a bare `SELECT ... FROM <cte_name> [WHERE
/// ...]` (no further joins against the self-reference) is supported; this
/// covers the counting/graph-traversal idioms the spec's examples describe.
fn compile_recursive(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    name: &str,
    all: bool,
    left: &SetExpr,
    right: &SetExpr,
    alias_columns: &[sqlparser::ast::TableAliasColumnDef],
) -> Result<()> {
    let recursive_select = match right {
        SetExpr::Select(s) => s.as_ref(),
        SetExpr::Query(q) => match q.body.as_ref() {
            SetExpr::Select(s) => s.as_ref(),
            other => bail_parse_error!("unsupported recursive CTE term: {other:?}"),
        },
        other => bail_parse_error!("unsupported recursive CTE term: {other:?}"),
    };
    if recursive_select.from.len() != 1 || !recursive_select.from[0].joins.is_empty() {
        bail_parse_error!("recursive CTE term for '{name}' must reference only '{name}' in its FROM clause");
    }
    if !factor_refs(&recursive_select.from[0].relation, name) {
        bail_parse_error!("recursive CTE term's FROM clause must reference '{name}'");
    }

    let mut schema = super::select::infer_schema_from_set_expr(catalog, left, name)?;
    super::select::apply_column_aliases(&mut schema, alias_columns)?;
    let schema = Arc::new(schema);
    let ncols = schema.columns.len();
    let result_conflict = if all { ConflictMode::Abort } else { ConflictMode::Ignore };
    let result_pk: Vec<usize> = if all { vec![] } else { (0..ncols).collect() };

    let result_cursor = program.allocate_cursor();
    program.table_schemas.insert(result_cursor, CursorKind::CteRef(schema.clone()));
    program.emit(Insn::OpenEphemeral {
        cursor_id: result_cursor,
        num_columns: ncols,
        primary_key: result_pk,
        conflict: result_conflict,
    });
    program.mark_cursor_opened(result_cursor);

    let queue_cursor = program.allocate_cursor();
    program.emit(Insn::OpenEphemeral {
        cursor_id: queue_cursor,
        num_columns: ncols,
        primary_key: vec![],
        conflict: ConflictMode::Abort,
    });
    program.mark_cursor_opened(queue_cursor);

    materialize_arm(program, catalog, left, result_cursor, ncols, result_conflict)?;
    materialize_arm(program, catalog, left, queue_cursor, ncols, ConflictMode::Abort)?;

    let next_read = program.allocate_register();
    program.emit(Insn::Integer { value: 1, dest: next_read });
    let one = program.allocate_register();
    program.emit(Insn::Integer { value: 1, dest: one });

    let self_table = JoinedTable {
        cursor: queue_cursor,
        alias: name.to_string(),
        source: TableSource::Cte { name: name.to_string() },
        schema: schema.clone(),
        join_kind: JoinKind::Cross,
        constraint: JoinConstraint::None,
    };
    let where_terms: Vec<WhereTerm> = recursive_select
        .selection
        .as_ref()
        .map(|w| {
            split_conjuncts(w)
                .into_iter()
                .map(|expr| WhereTerm { expr, consumed: false })
                .collect()
        })
        .unwrap_or_default();
    let result_exprs = recursive_select
        .projection
        .iter()
        .map(|item| match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => Ok(e.clone()),
            other => bail_parse_error!("unsupported recursive CTE projection: {other}"),
        })
        .collect::<Result<Vec<_>>>()?;

    let loop_top = program.current_address();
    let done = program.allocate_address(PlaceholderPurpose::Eof);
    program.emit(Insn::SeekRowid {
        cursor_id: queue_cursor,
        rowid_reg: next_read,
        target_pc: Addr::Pending(done),
    });
    program.emit(Insn::Add { lhs: next_read, rhs: one, dest: next_read });

    let tables = std::slice::from_ref(&self_table);
    let ctx = ExprCtx::new(tables);
    let skip = program.allocate_address(PlaceholderPurpose::Generic);
    for term in &where_terms {
        let v = program.allocate_register();
        translate_expr(program, catalog, &ctx, &term.expr, v)?;
        program.emit(Insn::IfFalse {
            reg: v,
            target_pc: Addr::Pending(skip),
            jump_if_null: true,
        });
    }

    let base = program.allocate_registers(ncols);
    for (i, e) in result_exprs.iter().enumerate() {
        translate_expr(program, catalog, &ctx, e, base + i)?;
    }

    if all {
        insert_row(program, result_cursor, base, ncols, ConflictMode::Abort)?;
        insert_row(program, queue_cursor, base, ncols, ConflictMode::Abort)?;
    } else {
        let rec = program.allocate_register();
        program.emit(Insn::MakeRecord { start_reg: base, count: ncols, dest: rec });
        let not_found = program.allocate_address(PlaceholderPurpose::Generic);
        program.emit(Insn::VFilter {
            cursor_id: result_cursor,
            pc_if_empty: Addr::Pending(not_found),
            args_start_reg: rec,
            plan: VFilterPlan {
                idx_num: 0,
                idx_str: None,
                n_args: ncols,
            },
        });
        // Already present in `result`: not a new row, nothing to enqueue.
        program.emit(Insn::Goto { target_pc: Addr::Pending(skip) });
        program.resolve_address(not_found)?;
        program.emit(Insn::VUpdate {
            cursor_id: result_cursor,
            argv_start_reg: rec,
            argv_count: 1,
            conflict: ConflictMode::Ignore,
        });
        insert_row(program, queue_cursor, base, ncols, ConflictMode::Abort)?;
    }

    program.resolve_address(skip)?;
    program.emit(Insn::Goto { target_pc: loop_top });
    program.resolve_address(done)?;

    program.emit(Insn::Close { cursor_id: queue_cursor });
    program.mark_cursor_closed(queue_cursor);

    program.cte_map.insert(
        name.to_string(),
        CteEntry {
            cursor: result_cursor,
            schema,
            recursive: true,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::vdbe::insn::Insn;
    use crate::CompileOptions;

    fn empty_catalog() -> crate::StaticCatalog {
        crate::StaticCatalog {
            tables: std::collections::HashMap::new(),
            functions: vec![],
            modules: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn recursive_cte_compiles_a_fixpoint_loop_over_two_ephemeral_tables() {
        let catalog = empty_catalog();
        let sql = "with recursive r(n) as (select 1 union all select n+1 from r where n<3) select n from r";
        let program = crate::compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
        let ephemeral_opens = program.instructions.iter().filter(|i| matches!(i, Insn::OpenEphemeral { .. })).count();
        assert!(ephemeral_opens >= 2, "expected a result table and a queue table: {program:?}");
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::SeekRowid { .. })));
    }

    #[test]
    fn recursive_without_recursive_keyword_is_rejected() {
        let catalog = empty_catalog();
        let sql = "with r(n) as (select 1 union all select n+1 from r where n<3) select n from r";
        let program = crate::compile_sql(&catalog, sql, &CompileOptions::default());
        assert!(program.is_err());
    }

    #[test]
    fn materialized_cte_opens_one_ephemeral_table_per_reference_pass() {
        let catalog = empty_catalog();
        let sql = "with x as (select 1 as n) select n from x";
        let program = crate::compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::OpenEphemeral { .. })));
    }
}
