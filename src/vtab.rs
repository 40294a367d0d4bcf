//! Virtual-table module contract (spec §6).
//!
//! A virtual table is an external data provider: the compiler only ever
//! calls `best_index` to obtain an access plan for a cursor. The module's
//! `connect`, row cursor, and the key-value store underneath it are out of
//! scope — this trait is the narrow interface the planner needs.

use crate::catalog::TableSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Ne,
    Match,
    Like,
    Glob,
    IsNull,
    IsNotNull,
}

/// One input constraint offered to `best_index`, derived from a WHERE-clause
/// conjunct that references only this cursor's columns (spec §4.2).
#[derive(Debug, Clone)]
pub struct IndexConstraint {
    pub column: usize,
    pub op: ConstraintOp,
    /// False for constraints referencing a correlated outer column the
    /// module cannot treat as a runtime-constant input.
    pub usable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderByTerm {
    pub column: usize,
    pub direction: SortDirection,
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub constraints: Vec<IndexConstraint>,
    pub order_by: Vec<OrderByTerm>,
    pub estimated_rows: Option<u64>,
}

/// Whether and how the module will consume a given input constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintUsage {
    /// 1-based position in the `VFilter` argv, if the module will consume
    /// this constraint's right-hand-side value as a filter argument.
    pub argv_index: Option<u32>,
    /// If true, the compiler may skip residual re-verification of this
    /// constraint at runtime (the module guarantees it itself).
    pub omit: bool,
}

/// The result of `best_index`: an opaque access plan plus enough bookkeeping
/// for the compiler to build `VFilter` and skip handled WHERE residuals.
#[derive(Debug, Clone)]
pub struct AccessPlan {
    pub idx_num: i32,
    pub idx_str: Option<String>,
    /// Parallel to the `constraints` vector passed into `best_index`.
    pub usage: Vec<ConstraintUsage>,
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: u64,
    pub explanation: Option<String>,
}

impl AccessPlan {
    /// A plan that handles nothing: full scan, every filter left as residual.
    pub fn full_scan(n_constraints: usize, estimated_rows: u64) -> Self {
        Self {
            idx_num: 0,
            idx_str: None,
            usage: vec![ConstraintUsage::default(); n_constraints],
            order_by_consumed: false,
            estimated_cost: estimated_rows as f64,
            estimated_rows,
            explanation: Some("SCAN".to_string()),
        }
    }
}

pub trait VirtualTableModule {
    fn connect(
        &self,
        module_name: &str,
        table_name: &str,
        options: &[String],
    ) -> crate::Result<TableSchema>;

    fn best_index(&self, table: &TableSchema, info: &IndexInfo) -> crate::Result<AccessPlan>;
}
