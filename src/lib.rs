//! SQL-to-bytecode compiler: translates a parsed SQL AST into a linear
//! program for a register-oriented virtual machine that executes against
//! virtual tables (spec §1).
//!
//! The lexer/parser, schema catalog, VDBE interpreter, virtual-table
//! modules, and the key-value store underneath them are external
//! collaborators; this crate only implements the compilation pipeline from
//! AST to bytecode (spec §1 scope).

pub mod catalog;
pub mod error;
pub mod translate;
pub mod value;
pub mod vdbe;
pub mod vtab;

use std::sync::Arc;

use sqlparser::ast::Statement;
use tracing::{instrument, Level};

pub use error::{CompileError, Result};
use vdbe::builder::{ProgramBuilder, ProgramBuilderOpts, QueryMode};
use vdbe::Program;

use catalog::Catalog;

/// Compile-time knobs the host may set; no file-based configuration is
/// loaded here (that belongs to the host, out of scope per spec §1).
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Guards against runaway recursion in pathological expression trees.
    pub max_expr_depth: usize,
    pub query_mode: QueryMode,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_expr_depth: 1000,
            query_mode: QueryMode::Normal,
        }
    }
}

/// Compile one parsed SQL statement into a `Program`.
///
/// This is the dispatcher described in spec §4.9/§9: select-per-statement-kind
/// compiler, then a final pass that builds and validates the `Program`.
#[instrument(skip_all, level = Level::DEBUG, fields(sql = %sql))]
pub fn compile(
    catalog: &dyn Catalog,
    stmt: &Statement,
    sql: &str,
    options: &CompileOptions,
) -> Result<Program> {
    let mut program = ProgramBuilder::new(ProgramBuilderOpts {
        query_mode: options.query_mode,
        approx_num_insns: 64,
    });

    translate::dispatch(&mut program, catalog, stmt, options)?;

    program.build(sql.to_string())
}

/// Convenience used by tests and simple hosts: parse with `sqlparser`'s
/// generic dialect and compile the first statement.
pub fn compile_sql(catalog: &dyn Catalog, sql: &str, options: &CompileOptions) -> Result<Program> {
    use sqlparser::dialect::SQLiteDialect;
    use sqlparser::parser::Parser;

    let stmts = Parser::parse_sql(&SQLiteDialect {}, sql).map_err(|e| CompileError::Parse {
        message: e.to_string(),
        location: None,
    })?;
    let stmt = stmts
        .first()
        .ok_or_else(|| CompileError::Syntax {
            message: "empty statement".to_string(),
            location: None,
        })?;
    compile(catalog, stmt, sql, options)
}

/// A minimal in-memory catalog, useful for tests and small embeddings where
/// all tables are already resolved.
pub struct StaticCatalog {
    pub tables: std::collections::HashMap<String, Arc<catalog::TableSchema>>,
    pub functions: Vec<catalog::FunctionInfo>,
    pub modules: std::collections::HashMap<String, Arc<dyn vtab::VirtualTableModule>>,
}

impl Catalog for StaticCatalog {
    fn find_table(&self, name: &str) -> Result<Arc<catalog::TableSchema>> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| CompileError::Syntax {
                message: format!("no such table: {name}"),
                location: None,
            })
    }

    fn find_function(&self, name: &str, n_args: usize) -> Option<catalog::FunctionInfo> {
        self.functions
            .iter()
            .find(|f| {
                f.name.eq_ignore_ascii_case(name)
                    && match f.num_args {
                        catalog::NumArgs::Fixed(n) => n == n_args,
                        catalog::NumArgs::Variadic => true,
                    }
            })
            .cloned()
    }

    fn find_collation(&self, name: &str) -> Option<catalog::CollationInfo> {
        Some(catalog::CollationInfo {
            name: name.to_string(),
        })
    }

    fn get_vtab_module(&self, name: &str) -> Option<Arc<dyn vtab::VirtualTableModule>> {
        self.modules.get(&name.to_ascii_lowercase()).cloned()
    }
}
