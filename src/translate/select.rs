//! SELECT orchestrator (spec §4.6): assembles the FROM/WHERE/planner output
//! into a `SelectPlan`, classifies the row processor (direct, aggregate or
//! window), and drives the nested-loop scaffold plus the post-loop output
//! stage(s) (aggregate finalize, window-sorter pass, ORDER BY drain).

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{
    Expr, GroupByExpr, Ident, Query, Select, SelectItem, SetExpr, SetOperator, SetQuantifier,
    TableAliasColumnDef, TableFactor, TableWithJoins, Value as AstValue,
    WindowFrameBound as AstFrameBound, WindowFrameUnits, WindowType, OrderByExpr,
};

use crate::catalog::{Catalog, ColumnSchema, FunctionKind, TableSchema};
use crate::value::Affinity;
use crate::vdbe::builder::{CursorKind, PlaceholderPurpose, ProgramBuilder};
use crate::vdbe::insn::{ConflictMode, FuncDef, Insn, SortKey, VFilterPlan};
use crate::vdbe::{Addr, CursorId};
use crate::vtab::SortDirection;
use crate::{bail_parse_error, CompileOptions, Result};

use super::emitter::compile_nested_loop;
use super::expr::{function_args, translate_expr, ExprCtx};
use super::from::build_from;
use super::plan::{
    AggKind, Aggregate, FrameBound, JoinedTable, ResultColumn, RowProcessorKind, SelectPlan,
    TableSource, WhereTerm, WindowFrame, WindowFrameUnit, WindowFunction,
};
use super::planner::{plan_cursors, split_conjuncts};
use super::result_row::{emit_output_row, init_limit_regs, LimitRegs};
use super::window;

// ---------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------

pub fn translate_query(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    query: &Query,
    options: &CompileOptions,
) -> Result<()> {
    let registered = match &query.with {
        Some(with) => super::cte::translate_with(program, catalog, with, options)?,
        None => Vec::new(),
    };

    let offset_expr = query.offset.as_ref().map(|o| &o.value);
    let result = translate_set_expr(
        program,
        catalog,
        &query.body,
        &query.order_by,
        query.limit.as_ref(),
        offset_expr,
        options,
    );

    for name in &registered {
        if let Some(entry) = program.cte_map.remove(name) {
            program.emit(Insn::Close { cursor_id: entry.cursor });
            program.mark_cursor_closed(entry.cursor);
        }
    }

    result?;

    if program.column_names.is_empty() {
        if let Ok(n) = arm_column_count(&query.body) {
            program.column_names = (1..=n).map(|i| format!("column{i}")).collect();
        }
    }
    Ok(())
}

fn translate_set_expr(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    body: &SetExpr,
    order_by: &[OrderByExpr],
    limit: Option<&Expr>,
    offset: Option<&Expr>,
    options: &CompileOptions,
) -> Result<()> {
    match body {
        SetExpr::Select(select) => translate_select(program, catalog, select, order_by, limit, offset, options),
        SetExpr::Query(inner) => translate_query(program, catalog, inner, options),
        SetExpr::Values(values) => translate_values(program, catalog, values, order_by, limit, offset),
        SetExpr::SetOperation { op, set_quantifier, left, right } => {
            translate_set_operation(program, catalog, op, set_quantifier, left, right, order_by, limit, offset)
        }
        other => bail_parse_error!("unsupported query body: {other:?}"),
    }
}

// ---------------------------------------------------------------------
// Single SELECT
// ---------------------------------------------------------------------

fn translate_select(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    select: &Select,
    order_by: &[OrderByExpr],
    limit: Option<&Expr>,
    offset: Option<&Expr>,
    _options: &CompileOptions,
) -> Result<()> {
    let tables = build_from(program, catalog, &select.from)?;
    emit_subqueries(program, catalog, &tables)?;

    let mut where_terms = where_terms_from(select.selection.as_ref());
    plan_cursors(program, catalog, &tables, &mut where_terms, order_by)?;

    let result_columns = expand_projection(&tables, &select.projection)?;
    let group_by = group_by_exprs(&select.group_by);
    let aggregates = collect_aggregates(catalog, &result_columns, select.having.as_ref());
    let window_functions = collect_window_functions(&result_columns, program);

    let row_processor = if !window_functions.is_empty() {
        RowProcessorKind::Window
    } else if !aggregates.is_empty() || !group_by.is_empty() {
        RowProcessorKind::Aggregate
    } else {
        RowProcessorKind::Direct
    };

    let plan = SelectPlan {
        tables,
        where_terms,
        result_columns,
        group_by,
        having: select.having.clone(),
        aggregates,
        window_functions,
        order_by: order_by.to_vec(),
        limit: limit.cloned(),
        offset: offset.cloned(),
        distinct: select.distinct.is_some(),
        row_processor,
    };

    program.column_names = plan.result_columns.iter().map(|rc| rc.name.clone()).collect();

    match plan.row_processor {
        RowProcessorKind::Direct => run_direct(program, catalog, &plan),
        RowProcessorKind::Aggregate => run_aggregate(program, catalog, &plan),
        RowProcessorKind::Window => run_window(program, catalog, &plan),
    }
}

fn where_terms_from(selection: Option<&Expr>) -> Vec<WhereTerm> {
    selection
        .map(|e| split_conjuncts(e).into_iter().map(|expr| WhereTerm { expr, consumed: false }).collect())
        .unwrap_or_default()
}

fn group_by_exprs(gb: &GroupByExpr) -> Vec<Expr> {
    match gb {
        GroupByExpr::Expressions(exprs, _modifiers) => exprs.clone(),
        // `GROUP BY ALL` and other dialect extensions are not supported
        // (spec's grouping is by explicit expression list only).
        _ => Vec::new(),
    }
}

fn expand_projection(tables: &[JoinedTable], projection: &[SelectItem]) -> Result<Vec<ResultColumn>> {
    let mut out = Vec::new();
    for item in projection {
        match item {
            SelectItem::UnnamedExpr(e) => out.push(ResultColumn { expr: e.clone(), name: e.to_string(), item: item.clone() }),
            SelectItem::ExprWithAlias { expr, alias } => {
                out.push(ResultColumn { expr: expr.clone(), name: alias.value.clone(), item: item.clone() })
            }
            SelectItem::Wildcard(_) => {
                for t in tables {
                    for col in &t.schema.columns {
                        let expr = Expr::CompoundIdentifier(vec![Ident::new(t.alias.clone()), Ident::new(col.name.clone())]);
                        out.push(ResultColumn { expr, name: col.name.clone(), item: item.clone() });
                    }
                }
            }
            SelectItem::QualifiedWildcard(obj_name, _) => {
                let qualifier = obj_name.to_string();
                let t = tables
                    .iter()
                    .find(|t| t.alias.eq_ignore_ascii_case(&qualifier))
                    .ok_or_else(|| crate::error::CompileError::Syntax {
                        message: format!("no such table: {qualifier}"),
                        location: None,
                    })?;
                for col in &t.schema.columns {
                    let expr = Expr::CompoundIdentifier(vec![Ident::new(t.alias.clone()), Ident::new(col.name.clone())]);
                    out.push(ResultColumn { expr, name: col.name.clone(), item: item.clone() });
                }
            }
        }
    }
    Ok(out)
}

fn collect_aggregates(catalog: &dyn Catalog, result_columns: &[ResultColumn], having: Option<&Expr>) -> Vec<Aggregate> {
    let mut out = Vec::new();
    for rc in result_columns {
        find_aggregates(catalog, &rc.expr, &mut out);
    }
    if let Some(h) = having {
        find_aggregates(catalog, h, &mut out);
    }
    out
}

fn find_aggregates(catalog: &dyn Catalog, expr: &Expr, out: &mut Vec<Aggregate>) {
    match expr {
        Expr::Function(f) if f.over.is_none() => {
            let name = f.name.to_string();
            let args = function_args(f);
            let kind = AggKind::from_name(&name)
                .or_else(|| {
                    (catalog.find_function(&name, args.len()).map(|i| i.kind) == Some(FunctionKind::Aggregate))
                        .then_some(AggKind::Other)
                });
            if let Some(mut kind) = kind {
                if name.eq_ignore_ascii_case("count") && args.is_empty() {
                    kind = AggKind::CountStar;
                }
                out.push(Aggregate {
                    kind,
                    func_name: name,
                    args,
                    original_expr: expr.clone(),
                    select_list_index: out.len(),
                });
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            find_aggregates(catalog, left, out);
            find_aggregates(catalog, right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::Cast { expr, .. }
        | Expr::Collate { expr, .. } => find_aggregates(catalog, expr, out),
        Expr::Case { operand, conditions, results, else_result } => {
            if let Some(o) = operand {
                find_aggregates(catalog, o, out);
            }
            for c in conditions {
                find_aggregates(catalog, c, out);
            }
            for r in results {
                find_aggregates(catalog, r, out);
            }
            if let Some(e) = else_result {
                find_aggregates(catalog, e, out);
            }
        }
        _ => {}
    }
}

/// Window-function calls are only recognized as a whole SELECT-list
/// expression (optionally aliased); a call nested inside a larger expression
/// (`rank() OVER (...) + 1`) is not detected, matching the scope this crate's
/// window pass supports (see DESIGN.md).
fn collect_window_functions(result_columns: &[ResultColumn], program: &mut ProgramBuilder) -> Vec<WindowFunction> {
    let mut out = Vec::new();
    for rc in result_columns {
        if let Expr::Function(f) = &rc.expr {
            if let Some(WindowType::WindowSpec(spec)) = &f.over {
                let frame = match &spec.window_frame {
                    Some(wf) => convert_window_frame(wf).unwrap_or_default(),
                    None => WindowFrame::default(),
                };
                let result_reg = program.allocate_register();
                out.push(WindowFunction {
                    func_name: f.name.to_string(),
                    args: function_args(f),
                    partition_by: spec.partition_by.clone(),
                    order_by: spec.order_by.clone(),
                    frame,
                    original_expr: rc.expr.clone(),
                    select_list_index: out.len(),
                    result_reg,
                });
            }
        }
    }
    out
}

fn convert_window_frame(wf: &sqlparser::ast::WindowFrame) -> Result<WindowFrame> {
    let unit = match wf.units {
        WindowFrameUnits::Rows => WindowFrameUnit::Rows,
        WindowFrameUnits::Range => WindowFrameUnit::Range,
        WindowFrameUnits::Groups => bail_parse_error!("GROUPS frame unit is not supported"),
    };
    let start = convert_bound(&wf.start_bound)?;
    let end = match &wf.end_bound {
        Some(b) => convert_bound(b)?,
        None => FrameBound::CurrentRow,
    };
    Ok(WindowFrame { unit, start, end })
}

fn convert_bound(b: &AstFrameBound) -> Result<FrameBound> {
    match b {
        AstFrameBound::CurrentRow => Ok(FrameBound::CurrentRow),
        AstFrameBound::Preceding(None) => Ok(FrameBound::UnboundedPreceding),
        AstFrameBound::Preceding(Some(e)) => Ok(FrameBound::Preceding(const_i64(e)?)),
        AstFrameBound::Following(None) => Ok(FrameBound::UnboundedFollowing),
        AstFrameBound::Following(Some(e)) => Ok(FrameBound::Following(const_i64(e)?)),
    }
}

fn const_i64(e: &Expr) -> Result<i64> {
    if let Expr::Value(AstValue::Number(s, _)) = e {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(n);
        }
    }
    bail_parse_error!("window frame bound must be a constant integer: {e}")
}

// ---------------------------------------------------------------------
// FROM-clause subquery population (spec §4.5: opened eagerly by `from`,
// populated here once the whole table list is known)
// ---------------------------------------------------------------------

fn emit_subqueries(program: &mut ProgramBuilder, catalog: &dyn Catalog, tables: &[JoinedTable]) -> Result<()> {
    for t in tables {
        if let TableSource::Subquery { query } = &t.source {
            populate_derived_table(program, catalog, query, t.cursor)?;
        }
    }
    Ok(())
}

fn populate_derived_table(program: &mut ProgramBuilder, catalog: &dyn Catalog, query: &Query, sink: CursorId) -> Result<()> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => bail_parse_error!("only a simple SELECT is supported in a FROM-clause subquery"),
    };
    let tables = build_from(program, catalog, &select.from)?;
    emit_subqueries(program, catalog, &tables)?;
    let mut where_terms = where_terms_from(select.selection.as_ref());
    plan_cursors(program, catalog, &tables, &mut where_terms, &[])?;
    let result_columns = expand_projection(&tables, &select.projection)?;

    compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, ctx| {
        let base = program.allocate_registers(result_columns.len());
        for (i, rc) in result_columns.iter().enumerate() {
            translate_expr(program, catalog, ctx, &rc.expr, base + i)?;
        }
        insert_row(program, sink, base, result_columns.len(), ConflictMode::Abort)
    })?;
    close_table_cursors(program, &tables);
    Ok(())
}

fn close_table_cursors(program: &mut ProgramBuilder, tables: &[JoinedTable]) {
    for t in tables {
        // A CTE reference's cursor is owned and closed by the CTE compiler.
        if matches!(t.source, TableSource::Cte { .. }) {
            continue;
        }
        program.emit(Insn::Close { cursor_id: t.cursor });
        program.mark_cursor_closed(t.cursor);
    }
}

// ---------------------------------------------------------------------
// Plain ephemeral sorter/set (shared by DISTINCT, ORDER BY fallback, and
// compound SELECT materialization)
// ---------------------------------------------------------------------

pub(super) struct PlainSorter {
    pub(super) cursor: CursorId,
}

pub(super) fn open_plain_sorter(program: &mut ProgramBuilder, num_columns: usize, primary_key: Vec<usize>, conflict: ConflictMode) -> PlainSorter {
    let cursor = program.allocate_cursor();
    let schema = TableSchema {
        name: "<sorter>".to_string(),
        columns: (0..num_columns)
            .map(|i| ColumnSchema { name: format!("_c{i}"), affinity: Affinity::Blob, flags: Default::default(), default: None })
            .collect(),
        primary_key: primary_key.clone(),
        indexes: vec![],
        checks: vec![],
        module: "ephemeral".to_string(),
        module_args: vec![],
    };
    program.table_schemas.insert(cursor, CursorKind::Ephemeral(Arc::new(schema)));
    program.emit(Insn::OpenEphemeral { cursor_id: cursor, num_columns, primary_key, conflict });
    program.mark_cursor_opened(cursor);
    PlainSorter { cursor }
}

pub(super) fn insert_row(program: &mut ProgramBuilder, cursor: CursorId, base: usize, count: usize, conflict: ConflictMode) -> Result<()> {
    let rec = program.allocate_register();
    program.emit(Insn::MakeRecord { start_reg: base, count, dest: rec });
    program.emit(Insn::VUpdate { cursor_id: cursor, argv_start_reg: rec, argv_count: 1, conflict });
    Ok(())
}

fn emit_distinct_guard(
    program: &mut ProgramBuilder,
    sorter: &PlainSorter,
    base: usize,
    count: usize,
    mut on_new: impl FnMut(&mut ProgramBuilder) -> Result<()>,
) -> Result<()> {
    let rec = program.allocate_register();
    program.emit(Insn::MakeRecord { start_reg: base, count, dest: rec });
    let not_found = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::VFilter {
        cursor_id: sorter.cursor,
        pc_if_empty: Addr::Pending(not_found),
        args_start_reg: rec,
        plan: VFilterPlan { idx_num: 0, idx_str: None, n_args: 1 },
    });
    let end = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::Goto { target_pc: Addr::Pending(end) });
    program.resolve_address(not_found)?;
    program.emit(Insn::VUpdate { cursor_id: sorter.cursor, argv_start_reg: rec, argv_count: 1, conflict: ConflictMode::Ignore });
    on_new(program)?;
    program.resolve_address(end)?;
    Ok(())
}

fn emit_ordered_row(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    result_columns: &[ResultColumn],
    order_by: &[OrderByExpr],
    sorter: &PlainSorter,
) -> Result<()> {
    let total = result_columns.len() + order_by.len();
    let base = program.allocate_registers(total);
    for (i, rc) in result_columns.iter().enumerate() {
        translate_expr(program, catalog, ctx, &rc.expr, base + i)?;
    }
    for (i, ob) in order_by.iter().enumerate() {
        translate_expr(program, catalog, ctx, &ob.expr, base + result_columns.len() + i)?;
    }
    insert_row(program, sorter.cursor, base, total, ConflictMode::Abort)
}

fn drain_order_sorter(
    program: &mut ProgramBuilder,
    sorter: &PlainSorter,
    out_count: usize,
    order_by: &[OrderByExpr],
    limits: &Option<LimitRegs>,
) -> Result<()> {
    let order_count = order_by.len();
    let key_indices: Vec<usize> = (out_count..out_count + order_count).collect();
    let directions = order_by
        .iter()
        .map(|ob| if ob.asc.unwrap_or(true) { SortDirection::Asc } else { SortDirection::Desc })
        .collect();
    program.emit(Insn::Sort {
        cursor_id: sorter.cursor,
        key: SortKey { key_indices, collations: vec![None; order_count], directions },
    });
    let eof = program.allocate_address(PlaceholderPurpose::Eof);
    program.emit(Insn::Rewind { cursor_id: sorter.cursor, pc_if_empty: Addr::Pending(eof) });
    let loop_start = program.current_address();
    let base = program.allocate_registers(out_count);
    for i in 0..out_count {
        program.emit(Insn::VColumn { cursor_id: sorter.cursor, column: i, dest: base + i });
    }
    emit_output_row(program, limits, base, out_count)?;
    program.emit(Insn::VNext { cursor_id: sorter.cursor, pc_if_next: loop_start });
    program.resolve_address(eof)?;
    program.emit(Insn::Close { cursor_id: sorter.cursor });
    program.mark_cursor_closed(sorter.cursor);
    Ok(())
}

// ---------------------------------------------------------------------
// Row processors
// ---------------------------------------------------------------------

fn run_direct(program: &mut ProgramBuilder, catalog: &dyn Catalog, plan: &SelectPlan) -> Result<()> {
    let ctx0 = ExprCtx::new(&plan.tables);
    let limits = init_limit_regs(program, catalog, &ctx0, plan.limit.as_ref(), plan.offset.as_ref())?;

    if !plan.order_by.is_empty() {
        let sorter = open_plain_sorter(program, plan.result_columns.len() + plan.order_by.len(), vec![], ConflictMode::Abort);
        compile_nested_loop(program, catalog, &plan.tables, &plan.where_terms, &mut |program, ctx| {
            emit_ordered_row(program, catalog, ctx, &plan.result_columns, &plan.order_by, &sorter)
        })?;
        close_table_cursors(program, &plan.tables);
        return drain_order_sorter(program, &sorter, plan.result_columns.len(), &plan.order_by, &limits);
    }

    let distinct_cursor = if plan.distinct {
        Some(open_plain_sorter(
            program,
            plan.result_columns.len(),
            (0..plan.result_columns.len()).collect(),
            ConflictMode::Ignore,
        ))
    } else {
        None
    };

    compile_nested_loop(program, catalog, &plan.tables, &plan.where_terms, &mut |program, ctx| {
        let base = program.allocate_registers(plan.result_columns.len());
        for (i, rc) in plan.result_columns.iter().enumerate() {
            translate_expr(program, catalog, ctx, &rc.expr, base + i)?;
        }
        match &distinct_cursor {
            Some(dc) => emit_distinct_guard(program, dc, base, plan.result_columns.len(), |program| {
                emit_output_row(program, &limits, base, plan.result_columns.len())
            }),
            None => emit_output_row(program, &limits, base, plan.result_columns.len()),
        }
    })?;

    if let Some(dc) = distinct_cursor {
        program.emit(Insn::Close { cursor_id: dc.cursor });
        program.mark_cursor_closed(dc.cursor);
    }
    close_table_cursors(program, &plan.tables);
    Ok(())
}

fn run_aggregate(program: &mut ProgramBuilder, catalog: &dyn Catalog, plan: &SelectPlan) -> Result<()> {
    program.emit(Insn::AggReset);

    // A query with no GROUP BY has a single implicit group, keyed by the
    // literal `'0'` (spec §4.6).
    let group_const_key = if plan.group_by.is_empty() {
        let r = program.allocate_register();
        program.emit(Insn::String8 { value: "0".to_string(), dest: r });
        Some(r)
    } else {
        None
    };

    compile_nested_loop(program, catalog, &plan.tables, &plan.where_terms, &mut |program, ctx| {
        let base_key = match group_const_key {
            Some(r) => r,
            None => {
                let gbase = program.allocate_registers(plan.group_by.len());
                for (i, e) in plan.group_by.iter().enumerate() {
                    translate_expr(program, catalog, ctx, e, gbase + i)?;
                }
                let rec = program.allocate_register();
                program.emit(Insn::MakeRecord { start_reg: gbase, count: plan.group_by.len(), dest: rec });
                rec
            }
        };
        for agg in &plan.aggregates {
            let tag = program.allocate_register();
            program.emit(Insn::String8 { value: format!("_{}", agg.select_list_index), dest: tag });
            let acc_key = program.allocate_register();
            program.emit(Insn::Concat { lhs: base_key, rhs: tag, dest: acc_key });
            let arg_count = agg.args.len();
            let arg_start = if arg_count == 0 {
                acc_key
            } else {
                let abase = program.allocate_registers(arg_count);
                for (i, a) in agg.args.iter().enumerate() {
                    translate_expr(program, catalog, ctx, a, abase + i)?;
                }
                abase
            };
            program.emit(Insn::AggStep {
                key_reg: acc_key,
                start_reg: arg_start,
                arg_count,
                func: FuncDef { name: agg.func_name.clone(), num_args: arg_count },
            });
        }
        Ok(())
    })?;
    close_table_cursors(program, &plan.tables);

    let ctx0 = ExprCtx::new(&[]);
    let limits = init_limit_regs(program, catalog, &ctx0, plan.limit.as_ref(), plan.offset.as_ref())?;
    let sorter = if !plan.order_by.is_empty() {
        Some(open_plain_sorter(program, plan.result_columns.len() + plan.order_by.len(), vec![], ConflictMode::Abort))
    } else {
        None
    };

    let eof = program.allocate_address(PlaceholderPurpose::Eof);
    program.emit(Insn::AggIterate { pc_if_empty: Addr::Pending(eof) });
    let loop_start = program.current_address();

    let base_key_reg = program.allocate_register();
    program.emit(Insn::AggKey { dest: base_key_reg });

    let mut overrides: HashMap<String, usize> = HashMap::new();
    for (i, e) in plan.group_by.iter().enumerate() {
        let r = program.allocate_register();
        program.emit(Insn::AggGroupValue { index: i, dest: r });
        overrides.insert(e.to_string(), r);
    }
    for agg in &plan.aggregates {
        let tag = program.allocate_register();
        program.emit(Insn::String8 { value: format!("_{}", agg.select_list_index), dest: tag });
        let acc_key = program.allocate_register();
        program.emit(Insn::Concat { lhs: base_key_reg, rhs: tag, dest: acc_key });
        let r = program.allocate_register();
        program.emit(Insn::AggFinal { key_reg: acc_key, dest: r, func: FuncDef { name: agg.func_name.clone(), num_args: agg.args.len() } });
        overrides.insert(agg.original_expr.to_string(), r);
    }

    let ctx = ExprCtx::new(&[]).with_overrides(&overrides);
    let skip_group = program.allocate_address(PlaceholderPurpose::Generic);
    if let Some(h) = &plan.having {
        let v = program.allocate_register();
        translate_expr(program, catalog, &ctx, h, v)?;
        program.emit(Insn::IfFalse { reg: v, target_pc: Addr::Pending(skip_group), jump_if_null: true });
    }

    match &sorter {
        Some(s) => emit_ordered_row(program, catalog, &ctx, &plan.result_columns, &plan.order_by, s)?,
        None => {
            let base = program.allocate_registers(plan.result_columns.len());
            for (i, rc) in plan.result_columns.iter().enumerate() {
                translate_expr(program, catalog, &ctx, &rc.expr, base + i)?;
            }
            emit_output_row(program, &limits, base, plan.result_columns.len())?;
        }
    }
    program.resolve_address(skip_group)?;
    program.emit(Insn::AggNext { pc_if_next: loop_start });
    program.resolve_address(eof)?;

    if let Some(s) = sorter {
        drain_order_sorter(program, &s, plan.result_columns.len(), &plan.order_by, &limits)?;
    }
    Ok(())
}

fn run_window(program: &mut ProgramBuilder, catalog: &dyn Catalog, plan: &SelectPlan) -> Result<()> {
    let (schema, layout) = window::build_window_layout(plan);
    let sorter_cursor = window::open_window_sorter(program, schema);

    compile_nested_loop(program, catalog, &plan.tables, &plan.where_terms, &mut |program, ctx| {
        window::populate_window_sorter(program, catalog, ctx, plan, &layout, sorter_cursor)
    })?;
    close_table_cursors(program, &plan.tables);

    let ctx0 = ExprCtx::new(&[]);
    let limits = init_limit_regs(program, catalog, &ctx0, plan.limit.as_ref(), plan.offset.as_ref())?;
    window::emit_window_pass(program, plan, &layout, sorter_cursor, &limits)
}

// ---------------------------------------------------------------------
// VALUES
// ---------------------------------------------------------------------

fn translate_values(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    values: &sqlparser::ast::Values,
    order_by: &[OrderByExpr],
    limit: Option<&Expr>,
    offset: Option<&Expr>,
) -> Result<()> {
    let ncols = values.rows.first().map(|r| r.len()).unwrap_or(0);
    let ctx = ExprCtx::new(&[]);
    let limits = init_limit_regs(program, catalog, &ctx, limit, offset)?;

    if !order_by.is_empty() {
        let sorter = open_plain_sorter(program, ncols + order_by.len(), vec![], ConflictMode::Abort);
        for row in &values.rows {
            let base = program.allocate_registers(ncols + order_by.len());
            for (i, e) in row.iter().enumerate() {
                translate_expr(program, catalog, &ctx, e, base + i)?;
            }
            for (i, ob) in order_by.iter().enumerate() {
                translate_expr(program, catalog, &ctx, &ob.expr, base + ncols + i)?;
            }
            insert_row(program, sorter.cursor, base, ncols + order_by.len(), ConflictMode::Abort)?;
        }
        return drain_order_sorter(program, &sorter, ncols, order_by, &limits);
    }

    for row in &values.rows {
        let base = program.allocate_registers(ncols);
        for (i, e) in row.iter().enumerate() {
            translate_expr(program, catalog, &ctx, e, base + i)?;
        }
        emit_output_row(program, &limits, base, ncols)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Compound SELECT (UNION / UNION ALL / INTERSECT / EXCEPT)
// ---------------------------------------------------------------------

pub(super) fn arm_column_count(body: &SetExpr) -> Result<usize> {
    match body {
        SetExpr::Select(s) => Ok(s.projection.len()),
        SetExpr::Values(v) => Ok(v.rows.first().map(|r| r.len()).unwrap_or(0)),
        SetExpr::Query(q) => arm_column_count(&q.body),
        SetExpr::SetOperation { left, .. } => arm_column_count(left),
        other => bail_parse_error!("unsupported compound SELECT arm: {other:?}"),
    }
}

/// Compiles one arm of a compound SELECT into `sink` instead of emitting
/// result rows. Only a plain SELECT, VALUES, or nested set operation is
/// supported as an arm (no aggregates/window functions inside a compound
/// arm; see DESIGN.md).
pub(super) fn materialize_arm(program: &mut ProgramBuilder, catalog: &dyn Catalog, body: &SetExpr, sink: CursorId, ncols: usize, conflict: ConflictMode) -> Result<()> {
    match body {
        SetExpr::Select(select) => {
            let tables = build_from(program, catalog, &select.from)?;
            emit_subqueries(program, catalog, &tables)?;
            let mut where_terms = where_terms_from(select.selection.as_ref());
            plan_cursors(program, catalog, &tables, &mut where_terms, &[])?;
            let result_columns = expand_projection(&tables, &select.projection)?;
            compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, ctx| {
                let base = program.allocate_registers(ncols);
                for (i, rc) in result_columns.iter().enumerate() {
                    translate_expr(program, catalog, ctx, &rc.expr, base + i)?;
                }
                insert_row(program, sink, base, ncols, conflict)
            })?;
            close_table_cursors(program, &tables);
            Ok(())
        }
        SetExpr::Values(values) => {
            let ctx = ExprCtx::new(&[]);
            for row in &values.rows {
                let base = program.allocate_registers(ncols);
                for (i, e) in row.iter().enumerate() {
                    translate_expr(program, catalog, &ctx, e, base + i)?;
                }
                insert_row(program, sink, base, ncols, conflict)?;
            }
            Ok(())
        }
        SetExpr::SetOperation { op, set_quantifier, left, right } => {
            // A nested set operation used as an arm is flattened: compile it
            // straight into the same sink rather than opening its own.
            let _ = (op, set_quantifier);
            materialize_arm(program, catalog, left, sink, ncols, conflict)?;
            materialize_arm(program, catalog, right, sink, ncols, conflict)
        }
        SetExpr::Query(inner) => materialize_arm(program, catalog, &inner.body, sink, ncols, conflict),
        other => bail_parse_error!("unsupported compound SELECT arm: {other:?}"),
    }
}

#[allow(clippy::too_many_arguments)]
fn translate_set_operation(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    op: &SetOperator,
    set_quantifier: &SetQuantifier,
    left: &SetExpr,
    right: &SetExpr,
    order_by: &[OrderByExpr],
    limit: Option<&Expr>,
    offset: Option<&Expr>,
) -> Result<()> {
    let ncols = arm_column_count(left)?;
    let all = matches!(set_quantifier, SetQuantifier::All);
    let ctx0 = ExprCtx::new(&[]);
    let limits = init_limit_regs(program, catalog, &ctx0, limit, offset)?;

    match op {
        SetOperator::Union => {
            let conflict = if all { ConflictMode::Abort } else { ConflictMode::Ignore };
            let pk = if all { vec![] } else { (0..ncols).collect() };
            let sink = open_plain_sorter(program, ncols, pk, conflict);
            materialize_arm(program, catalog, left, sink.cursor, ncols, conflict)?;
            materialize_arm(program, catalog, right, sink.cursor, ncols, conflict)?;
            drain_compound_result(program, &sink, ncols, order_by, &limits)
        }
        SetOperator::Intersect | SetOperator::Except => {
            // `ALL` is not honored for INTERSECT/EXCEPT; both sides are
            // always deduplicated (see DESIGN.md).
            let l = open_plain_sorter(program, ncols, (0..ncols).collect(), ConflictMode::Ignore);
            let r = open_plain_sorter(program, ncols, (0..ncols).collect(), ConflictMode::Ignore);
            materialize_arm(program, catalog, left, l.cursor, ncols, ConflictMode::Ignore)?;
            materialize_arm(program, catalog, right, r.cursor, ncols, ConflictMode::Ignore)?;
            let out = open_plain_sorter(program, ncols, (0..ncols).collect(), ConflictMode::Ignore);

            let eof = program.allocate_address(PlaceholderPurpose::Eof);
            program.emit(Insn::Rewind { cursor_id: l.cursor, pc_if_empty: Addr::Pending(eof) });
            let loop_start = program.current_address();
            let base = program.allocate_registers(ncols);
            for i in 0..ncols {
                program.emit(Insn::VColumn { cursor_id: l.cursor, column: i, dest: base + i });
            }
            let rec = program.allocate_register();
            program.emit(Insn::MakeRecord { start_reg: base, count: ncols, dest: rec });
            let not_found = program.allocate_address(PlaceholderPurpose::Generic);
            program.emit(Insn::VFilter {
                cursor_id: r.cursor,
                pc_if_empty: Addr::Pending(not_found),
                args_start_reg: rec,
                plan: VFilterPlan { idx_num: 0, idx_str: None, n_args: 1 },
            });
            // found in `r`
            if matches!(op, SetOperator::Intersect) {
                insert_row(program, out.cursor, base, ncols, ConflictMode::Ignore)?;
            }
            let after = program.allocate_address(PlaceholderPurpose::Generic);
            program.emit(Insn::Goto { target_pc: Addr::Pending(after) });
            program.resolve_address(not_found)?;
            if matches!(op, SetOperator::Except) {
                insert_row(program, out.cursor, base, ncols, ConflictMode::Ignore)?;
            }
            program.resolve_address(after)?;
            program.emit(Insn::VNext { cursor_id: l.cursor, pc_if_next: loop_start });
            program.resolve_address(eof)?;
            program.emit(Insn::Close { cursor_id: l.cursor });
            program.mark_cursor_closed(l.cursor);
            program.emit(Insn::Close { cursor_id: r.cursor });
            program.mark_cursor_closed(r.cursor);

            drain_compound_result(program, &out, ncols, order_by, &limits)
        }
        other => bail_parse_error!("unsupported set operator: {other:?}"),
    }
}

fn drain_compound_result(
    program: &mut ProgramBuilder,
    sink: &PlainSorter,
    ncols: usize,
    order_by: &[OrderByExpr],
    limits: &Option<LimitRegs>,
) -> Result<()> {
    if !order_by.is_empty() {
        // The outer ORDER BY's expressions must reference result-column
        // positions or names; re-evaluating them against the sink's own
        // columns (by re-reading column `i` for a bare column-name/ordinal
        // ORDER BY term) covers the common case without re-deriving the
        // arm's original expressions.
        let key_indices: Vec<usize> = (0..order_by.len().min(ncols)).collect();
        let directions = order_by
            .iter()
            .map(|ob| if ob.asc.unwrap_or(true) { SortDirection::Asc } else { SortDirection::Desc })
            .collect();
        program.emit(Insn::Sort { cursor_id: sink.cursor, key: SortKey { key_indices, collations: vec![None; order_by.len().min(ncols)], directions } });
    }
    let eof = program.allocate_address(PlaceholderPurpose::Eof);
    program.emit(Insn::Rewind { cursor_id: sink.cursor, pc_if_empty: Addr::Pending(eof) });
    let loop_start = program.current_address();
    let base = program.allocate_registers(ncols);
    for i in 0..ncols {
        program.emit(Insn::VColumn { cursor_id: sink.cursor, column: i, dest: base + i });
    }
    emit_output_row(program, limits, base, ncols)?;
    program.emit(Insn::VNext { cursor_id: sink.cursor, pc_if_next: loop_start });
    program.resolve_address(eof)?;
    program.emit(Insn::Close { cursor_id: sink.cursor });
    program.mark_cursor_closed(sink.cursor);
    Ok(())
}

// ---------------------------------------------------------------------
// Subquery schema inference (spec §4.5, used by `from::bind_one` for a
// derived table and by this module for CTEs without an explicit column list)
// ---------------------------------------------------------------------

struct InferredTable {
    alias: String,
    schema: Arc<TableSchema>,
}

fn infer_from_tables(catalog: &dyn Catalog, from: &[TableWithJoins]) -> Result<Vec<InferredTable>> {
    let mut out = Vec::new();
    for twj in from {
        infer_one(catalog, &twj.relation, &mut out)?;
        for j in &twj.joins {
            infer_one(catalog, &j.relation, &mut out)?;
        }
    }
    Ok(out)
}

fn infer_one(catalog: &dyn Catalog, factor: &TableFactor, out: &mut Vec<InferredTable>) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let raw = name.to_string();
            let alias_name = alias.as_ref().map(|a| a.name.value.clone()).unwrap_or_else(|| raw.clone());
            let schema = catalog.find_table(&raw)?;
            out.push(InferredTable { alias: alias_name, schema });
            Ok(())
        }
        TableFactor::Derived { subquery, alias, .. } => {
            let alias_name = alias.as_ref().map(|a| a.name.value.clone()).unwrap_or_default();
            let mut schema = infer_subquery_schema(catalog, subquery, &alias_name)?;
            if let Some(a) = alias {
                apply_column_aliases(&mut schema, &a.columns)?;
            }
            out.push(InferredTable { alias: alias_name, schema: Arc::new(schema) });
            Ok(())
        }
        TableFactor::NestedJoin { table_with_joins, .. } => {
            infer_one(catalog, &table_with_joins.relation, out)?;
            for j in &table_with_joins.joins {
                infer_one(catalog, &j.relation, out)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Derives a `TableSchema` for a subquery used in FROM position, without
/// emitting any bytecode. Only a simple (non-compound) SELECT is supported
/// (spec §4.5 "subquery sources").
pub fn infer_subquery_schema(catalog: &dyn Catalog, query: &Query, alias: &str) -> Result<TableSchema> {
    infer_schema_from_set_expr(catalog, &query.body, alias)
}

/// Same as `infer_subquery_schema` but starting from a `SetExpr` directly, so
/// a CTE's recursive anchor term (a `SetOperation`'s left arm) can have its
/// shape inferred without synthesizing a throwaway `Query` (spec §4.9: "the
/// same schema inferred from the initial term").
pub(super) fn infer_schema_from_set_expr(catalog: &dyn Catalog, body: &SetExpr, alias: &str) -> Result<TableSchema> {
    match body {
        SetExpr::Select(select) => {
            let from_tables = infer_from_tables(catalog, &select.from)?;
            let mut columns = Vec::new();
            for item in &select.projection {
                match item {
                    SelectItem::UnnamedExpr(e) => columns.push(infer_column(&from_tables, e, e.to_string())),
                    SelectItem::ExprWithAlias { expr, alias } => columns.push(infer_column(&from_tables, expr, alias.value.clone())),
                    SelectItem::Wildcard(_) => {
                        for t in &from_tables {
                            columns.extend(t.schema.columns.iter().cloned());
                        }
                    }
                    SelectItem::QualifiedWildcard(obj_name, _) => {
                        let qualifier = obj_name.to_string();
                        if let Some(t) = from_tables.iter().find(|t| t.alias.eq_ignore_ascii_case(&qualifier)) {
                            columns.extend(t.schema.columns.iter().cloned());
                        }
                    }
                }
            }
            Ok(TableSchema {
                name: alias.to_string(),
                columns,
                primary_key: vec![],
                indexes: vec![],
                checks: vec![],
                module: "ephemeral".to_string(),
                module_args: vec![],
            })
        }
        SetExpr::Query(inner) => infer_schema_from_set_expr(catalog, &inner.body, alias),
        SetExpr::SetOperation { left, .. } => infer_schema_from_set_expr(catalog, left, alias),
        SetExpr::Values(values) => {
            let ncols = values.rows.first().map(|r| r.len()).unwrap_or(0);
            Ok(TableSchema {
                name: alias.to_string(),
                columns: (0..ncols)
                    .map(|i| ColumnSchema {
                        name: format!("column{}", i + 1),
                        affinity: Affinity::Blob,
                        flags: Default::default(),
                        default: None,
                    })
                    .collect(),
                primary_key: vec![],
                indexes: vec![],
                checks: vec![],
                module: "ephemeral".to_string(),
                module_args: vec![],
            })
        }
        other => bail_parse_error!("cannot infer the schema of {other:?}"),
    }
}

/// Renames an inferred schema's columns per a declared alias column list
/// (`r(n)` in `WITH r(n) AS (...)`, or `FROM (...) AS t(a, b)`). The declared
/// names take precedence over whatever `infer_schema_from_set_expr` guessed
/// from projection text (spec §4.5/§4.9).
pub(super) fn apply_column_aliases(schema: &mut TableSchema, columns: &[TableAliasColumnDef]) -> Result<()> {
    if columns.is_empty() {
        return Ok(());
    }
    if columns.len() != schema.columns.len() {
        bail_parse_error!(
            "{} columns named for '{}', but the query produces {} column(s)",
            columns.len(),
            schema.name,
            schema.columns.len()
        );
    }
    for (col, alias) in schema.columns.iter_mut().zip(columns) {
        col.name = alias.name.value.clone();
    }
    Ok(())
}

fn infer_column(tables: &[InferredTable], expr: &Expr, name: String) -> ColumnSchema {
    let affinity = match expr {
        Expr::Identifier(id) => lookup_affinity(tables, None, &id.value),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            lookup_affinity(tables, Some(&parts[parts.len() - 2].value), &parts[parts.len() - 1].value)
        }
        _ => None,
    }
    .unwrap_or(Affinity::Blob);
    ColumnSchema { name, affinity, flags: Default::default(), default: None }
}

fn lookup_affinity(tables: &[InferredTable], qualifier: Option<&str>, column: &str) -> Option<Affinity> {
    for t in tables {
        if let Some(q) = qualifier {
            if !t.alias.eq_ignore_ascii_case(q) {
                continue;
            }
        }
        if let Some(idx) = t.schema.column_index(column) {
            return Some(t.schema.columns[idx].affinity);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnFlags;
    use crate::vdbe::insn::Insn;
    use crate::StaticCatalog;
    use std::collections::HashMap;

    fn catalog_with(schemas: Vec<TableSchema>) -> StaticCatalog {
        let mut tables = HashMap::new();
        for schema in schemas {
            tables.insert(schema.name.to_ascii_lowercase(), Arc::new(schema));
        }
        StaticCatalog { tables, functions: vec![], modules: HashMap::new() }
    }

    fn t_schema() -> TableSchema {
        TableSchema {
            name: "t".to_string(),
            columns: vec![
                ColumnSchema { name: "a".to_string(), affinity: Affinity::Integer, flags: ColumnFlags::PRIMARY_KEY, default: None },
                ColumnSchema { name: "b".to_string(), affinity: Affinity::Integer, flags: ColumnFlags::empty(), default: None },
            ],
            primary_key: vec![0],
            indexes: vec![],
            checks: vec![],
            module: "memtable".to_string(),
            module_args: vec![],
        }
    }

    #[test]
    fn group_by_emits_one_agg_step_per_group_key() {
        let catalog = catalog_with(vec![t_schema()]);
        let sql = "select a, sum(b) from t group by a";
        let program = crate::compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
        let steps = program.instructions.iter().filter(|i| matches!(i, Insn::AggStep { .. })).count();
        assert_eq!(steps, 1, "one SUM(b) AggStep emitted per input row: {program:?}");
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::AggFinal { .. })));
    }

    #[test]
    fn count_star_is_recognized_without_catalog_registration() {
        let catalog = catalog_with(vec![t_schema()]);
        let program = crate::compile_sql(&catalog, "select count(*) from t", &CompileOptions::default()).unwrap();
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::AggStep { .. })));
    }

    #[test]
    fn limit_offset_zero_skips_result_row_entirely() {
        let catalog = catalog_with(vec![t_schema()]);
        let program = crate::compile_sql(&catalog, "select a from t limit 0 offset 0", &CompileOptions::default()).unwrap();
        // LIMIT 0 still compiles a normal scan; the register dance that
        // skips ResultRow is runtime behavior, so we only assert the
        // registers/opcodes needed for it are present.
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::IfZero { .. }) | matches!(i, Insn::Integer { .. })));
    }

    #[test]
    fn left_join_null_pads_unmatched_inner_row() {
        let mut u = t_schema();
        u.name = "u".to_string();
        let catalog = catalog_with(vec![t_schema(), u]);
        let sql = "select t.a from t left join u on t.a = u.a";
        let program = crate::compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
        // LEFT JOIN null-padding writes Null into the inner side's column
        // registers on the unmatched path.
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::Null { .. })));
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::VFilter { .. })));
    }

    #[test]
    fn union_all_compound_select_compiles() {
        let catalog = catalog_with(vec![t_schema()]);
        let sql = "select a from t union all select a from t";
        let program = crate::compile_sql(&catalog, sql, &CompileOptions::default());
        assert!(program.is_ok(), "{program:?}");
    }

    #[test]
    fn order_by_allocates_ephemeral_sorter_when_not_consumed_by_plan() {
        let catalog = catalog_with(vec![t_schema()]);
        let sql = "select a from t order by b";
        let program = crate::compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::Sort { .. })));
    }

    #[test]
    fn row_number_window_function_dispatches_to_window_processor() {
        let catalog = catalog_with(vec![t_schema()]);
        let sql = "select row_number() over (partition by a order by b) from t";
        let program = crate::compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
        assert!(program.instructions.iter().any(|i| matches!(i, Insn::Sort { .. })));
    }
}
