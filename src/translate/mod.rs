//! The VDBE bytecode code generator.
//!
//! Translates one parsed SQL statement into a sequence of instructions for
//! the VDBE, a register-based virtual machine that executes against virtual
//! tables. `dispatch` is the entry point selecting the per-statement-kind
//! compiler (spec §4.9 state machine / §9 "statement dispatch").

pub(crate) mod cte;
pub(crate) mod delete;
pub(crate) mod emitter;
pub(crate) mod expr;
pub(crate) mod from;
pub(crate) mod insert;
pub(crate) mod plan;
pub(crate) mod planner;
pub(crate) mod result_row;
pub(crate) mod select;
pub(crate) mod subquery;
pub(crate) mod transaction;
pub(crate) mod update;
pub(crate) mod window;

use sqlparser::ast::Statement;

use crate::catalog::Catalog;
use crate::vdbe::builder::ProgramBuilder;
use crate::{bail_parse_error, CompileOptions, Result};

use delete::translate_delete;
use insert::translate_insert;
use select::translate_query;
use transaction::{
    translate_begin, translate_commit, translate_release, translate_rollback,
    translate_savepoint,
};
use update::translate_update;

pub fn dispatch(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    stmt: &Statement,
    options: &CompileOptions,
) -> Result<()> {
    match stmt {
        Statement::Query(query) => translate_query(program, catalog, query, options),
        Statement::Insert(insert) => translate_insert(program, catalog, insert),
        Statement::Update {
            table,
            assignments,
            from,
            selection,
            or,
            ..
        } => translate_update(program, catalog, table, assignments, from.as_ref(), selection, *or),
        Statement::Delete(delete) => translate_delete(program, catalog, delete),
        Statement::StartTransaction { modes, .. } => translate_begin(program, modes),
        Statement::Commit { .. } => translate_commit(program),
        Statement::Rollback { savepoint, .. } => translate_rollback(program, savepoint.as_deref()),
        Statement::Savepoint { name } => translate_savepoint(program, &name.value),
        Statement::ReleaseSavepoint { name } => translate_release(program, &name.value),
        other => bail_parse_error!("statement not supported: {other}"),
    }
}
