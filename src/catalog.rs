//! Schema catalog interface (spec §6, "Consumed from the schema catalog").
//!
//! The catalog itself — table resolution, function/collation registries,
//! virtual-table module lookup — is an external collaborator. This module
//! only defines the shapes the compiler consumes; no implementation of
//! storage, indexing, or module registration lives here.

use std::sync::Arc;

use sqlparser::ast::Expr;

use crate::value::{Affinity, Value};
use crate::vtab::VirtualTableModule;

bitflags::bitflags! {
    /// Column-level constraint flags (spec §4.8: NOT NULL / DEFAULT / PK
    /// enforcement). A bitflag set rather than separate bools, matching the
    /// teacher's convention of `bitflags`-backed schema/attribute sets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ColumnFlags: u8 {
        const NOT_NULL    = 0b0001;
        const PRIMARY_KEY = 0b0010;
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub affinity: Affinity,
    pub flags: ColumnFlags,
    pub default: Option<DefaultValue>,
}

impl ColumnSchema {
    pub fn not_null(&self) -> bool {
        self.flags.contains(ColumnFlags::NOT_NULL)
    }

    pub fn is_primary_key(&self) -> bool {
        self.flags.contains(ColumnFlags::PRIMARY_KEY)
    }
}

#[derive(Debug, Clone)]
pub enum DefaultValue {
    Literal(Value),
    /// A compile-time-evaluable expression (e.g. `DEFAULT (abs(-1))`).
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<usize>,
    pub unique: bool,
}

/// An immutable snapshot of a table's shape as seen by the compiler.
/// Constructed once by the catalog via `find_table`; the compiler never
/// mutates it (spec's "ephemeral-schema objects... build with a builder and
/// freeze them" redesign note applies here too).
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Column indices making up the PRIMARY KEY, in declared order.
    pub primary_key: Vec<usize>,
    pub indexes: Vec<IndexSchema>,
    pub checks: Vec<Expr>,
    /// Name of the virtual-table module backing this table.
    pub module: String,
    /// Opaque module-specific connection arguments, echoed back on open.
    pub module_args: Vec<String>,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let target = uncased::UncasedStr::new(name);
        self.columns
            .iter()
            .position(|c| uncased::UncasedStr::new(&c.name) == target)
    }

    pub fn is_rowid_alias(&self, col_idx: usize) -> bool {
        self.primary_key == [col_idx] && self.columns[col_idx].affinity == Affinity::Integer
    }

    pub fn column(&self, idx: usize) -> &ColumnSchema {
        &self.columns[idx]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumArgs {
    Fixed(usize),
    Variadic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
    Window,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub num_args: NumArgs,
    pub affinity: Option<Affinity>,
    pub kind: FunctionKind,
}

#[derive(Debug, Clone)]
pub struct CollationInfo {
    pub name: String,
}

/// External collaborator: resolves names into schema/function/module facts.
/// Borrowed by the compiler for the duration of one `compile()` call
/// (lifetime >= program, per spec §5).
pub trait Catalog {
    fn find_table(&self, name: &str) -> crate::Result<Arc<TableSchema>>;
    fn find_function(&self, name: &str, n_args: usize) -> Option<FunctionInfo>;
    fn find_collation(&self, name: &str) -> Option<CollationInfo>;
    fn get_vtab_module(&self, name: &str) -> Option<Arc<dyn VirtualTableModule>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema {
            name: "t".to_string(),
            columns: vec![
                ColumnSchema { name: "Id".to_string(), affinity: Affinity::Integer, flags: ColumnFlags::PRIMARY_KEY, default: None },
                ColumnSchema { name: "name".to_string(), affinity: Affinity::Text, flags: ColumnFlags::NOT_NULL, default: None },
            ],
            primary_key: vec![0],
            indexes: vec![],
            checks: vec![],
            module: "memtable".to_string(),
            module_args: vec![],
        }
    }

    #[test]
    fn column_index_is_case_insensitive() {
        let s = schema();
        assert_eq!(s.column_index("id"), Some(0));
        assert_eq!(s.column_index("NAME"), Some(1));
        assert_eq!(s.column_index("missing"), None);
    }

    #[test]
    fn integer_pk_single_column_is_a_rowid_alias() {
        let s = schema();
        assert!(s.is_rowid_alias(0));
        assert!(!s.is_rowid_alias(1));
    }

    #[test]
    fn non_integer_pk_is_not_a_rowid_alias() {
        let mut s = schema();
        s.columns[0].affinity = Affinity::Text;
        assert!(!s.is_rowid_alias(0));
    }
}
