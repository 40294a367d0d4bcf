//! Shared plan data threaded between the FROM compiler, planner, SELECT
//! orchestrator and window pass (spec §9 redesign note: "re-walking the
//! SELECT core to recover column maps... -> compute the column map once in
//! §4.6 and pass it to all consumers").

use std::sync::Arc;

use sqlparser::ast::{Expr, OrderByExpr, SelectItem};

use crate::catalog::TableSchema;
use crate::vdbe::CursorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
}

#[derive(Debug, Clone)]
pub enum JoinConstraint {
    On(Expr),
    Using(Vec<String>),
    None,
}

/// How a FROM-clause source is bound to its cursor (spec §4.5).
#[derive(Debug, Clone)]
pub enum TableSource {
    /// An ordinary virtual table, or a reference to a previously-registered
    /// CTE (the pre-pass checks `cte_map` first, per spec §4.5).
    Base { table_name: String },
    Cte { name: String },
    Subquery { query: Box<sqlparser::ast::Query> },
    TableValuedFunction { name: String, args: Vec<String> },
}

/// One level of the flattened, left-to-right join list (spec §4.5 "join levels").
#[derive(Debug, Clone)]
pub struct JoinedTable {
    pub cursor: CursorId,
    pub alias: String,
    pub source: TableSource,
    pub schema: Arc<TableSchema>,
    /// Join type/condition carried *by this level* against everything to its
    /// left (the first level's join_kind is never read).
    pub join_kind: JoinKind,
    pub constraint: JoinConstraint,
}

/// A WHERE-clause top-level AND-conjunct, with plan-consumption bookkeeping
/// (spec's "handled node" from the GLOSSARY).
#[derive(Debug, Clone)]
pub struct WhereTerm {
    pub expr: Expr,
    /// Set once the planner (or join ON/USING compiler) has decided this
    /// term is fully handled and omit-safe; the residual compiler skips it.
    pub consumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Count,
    CountStar,
    Sum,
    Avg,
    Min,
    Max,
    GroupConcat,
    Other,
}

impl AggKind {
    pub fn from_name(name: &str) -> Option<AggKind> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggKind::Count),
            "sum" => Some(AggKind::Sum),
            "avg" => Some(AggKind::Avg),
            "min" => Some(AggKind::Min),
            "max" => Some(AggKind::Max),
            "group_concat" | "string_agg" => Some(AggKind::GroupConcat),
            "total" => Some(AggKind::Other),
            _ => None,
        }
    }
}

/// An aggregate function occurrence found in the SELECT list or HAVING
/// clause (spec §4.6).
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub kind: AggKind,
    pub func_name: String,
    pub args: Vec<Expr>,
    pub original_expr: Expr,
    /// Index into the SELECT list this aggregate came from, used to build
    /// the compound accumulator key `baseKey ++ "_" ++ i` (spec §4.6).
    pub select_list_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFrameUnit {
    Rows,
    Range,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(i64),
    CurrentRow,
    Following(i64),
    UnboundedFollowing,
}

#[derive(Debug, Clone)]
pub struct WindowFrame {
    pub unit: WindowFrameUnit,
    pub start: FrameBound,
    pub end: FrameBound,
}

impl Default for WindowFrame {
    fn default() -> Self {
        WindowFrame {
            unit: WindowFrameUnit::Range,
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::CurrentRow,
        }
    }
}

/// A window function occurrence (spec §4.6/§4.7).
#[derive(Debug, Clone)]
pub struct WindowFunction {
    pub func_name: String,
    pub args: Vec<Expr>,
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub frame: WindowFrame,
    pub original_expr: Expr,
    pub select_list_index: usize,
    /// Register the window pass writes the finalized per-row value into;
    /// the expression compiler replaces references to this function with a
    /// move from this register (spec §4.3 table, "window function reference").
    pub result_reg: usize,
}

#[derive(Debug, Clone)]
pub struct ResultColumn {
    pub expr: Expr,
    pub name: String,
    pub item: SelectItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowProcessorKind {
    Direct,
    Aggregate,
    Window,
}

/// The column map computed once in §4.6 and threaded to every consumer that
/// otherwise would re-walk the SELECT core: LEFT JOIN null-padding, HAVING's
/// `final_column_map`, and ORDER-BY-key-to-result-column resolution.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    /// For each SELECT-list / group-key position, the source this value
    /// comes from once a row reaches the output stage.
    pub entries: Vec<ColumnMapEntry>,
}

#[derive(Debug, Clone)]
pub enum ColumnMapEntry {
    /// Read live from a cursor during the main loop (direct row processor,
    /// or before aggregation finalizes).
    Cursor { cursor: CursorId, column: usize },
    /// Read from a register holding a finalized group key or aggregate
    /// result (aggregate row processor's HAVING/output stage).
    Register(usize),
}

/// The fully-planned SELECT, assembled once by `from`+`planner` and
/// consumed by `select`/`window`/`subquery` (spec §4.6).
pub struct SelectPlan {
    pub tables: Vec<JoinedTable>,
    pub where_terms: Vec<WhereTerm>,
    pub result_columns: Vec<ResultColumn>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub aggregates: Vec<Aggregate>,
    pub window_functions: Vec<WindowFunction>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
    pub distinct: bool,
    pub row_processor: RowProcessorKind,
}
