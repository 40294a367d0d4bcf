//! Transactional statements lowered to VM opcodes (spec §4.10).

use sqlparser::ast::TransactionMode;

use crate::vdbe::builder::ProgramBuilder;
use crate::vdbe::insn::{Insn, TxMode};
use crate::Result;

/// `BEGIN [DEFERRED|IMMEDIATE|EXCLUSIVE]` -> `VBegin` (spec §4.10). The
/// generic SQL `TransactionMode` list (access mode / isolation level) does
/// not carry SQLite's locking-mode keyword, so a dialect-specific AST would
/// plumb that through separately; here DEFERRED is the default, matching
/// SQLite itself when no keyword is given.
pub fn translate_begin(program: &mut ProgramBuilder, _modes: &[TransactionMode]) -> Result<()> {
    program.emit(Insn::VBegin {
        mode: TxMode::Deferred,
    });
    Ok(())
}

pub fn translate_commit(program: &mut ProgramBuilder) -> Result<()> {
    program.emit(Insn::VCommit);
    Ok(())
}

pub fn translate_rollback(program: &mut ProgramBuilder, to_savepoint: Option<&str>) -> Result<()> {
    match to_savepoint {
        Some(name) => {
            program.emit(Insn::Savepoint {
                op: 0,
                name: name.to_string(),
            });
            program.emit(Insn::VRollbackTo {
                name: name.to_string(),
            });
        }
        None => {
            program.emit(Insn::VRollback);
        }
    }
    Ok(())
}

pub fn translate_savepoint(program: &mut ProgramBuilder, name: &str) -> Result<()> {
    program.emit(Insn::Savepoint {
        op: 1,
        name: name.to_string(),
    });
    program.emit(Insn::VSavepoint {
        name: name.to_string(),
    });
    Ok(())
}

pub fn translate_release(program: &mut ProgramBuilder, name: &str) -> Result<()> {
    program.emit(Insn::Savepoint {
        op: 2,
        name: name.to_string(),
    });
    program.emit(Insn::VRelease {
        name: name.to_string(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdbe::builder::{ProgramBuilderOpts, QueryMode};

    fn program() -> ProgramBuilder {
        ProgramBuilder::new(ProgramBuilderOpts { query_mode: QueryMode::Normal, approx_num_insns: 8 })
    }

    #[test]
    fn begin_emits_vbegin_deferred() {
        let mut p = program();
        translate_begin(&mut p, &[]).unwrap();
        let out = p.build("BEGIN".to_string()).unwrap();
        assert!(matches!(out.instructions[0], Insn::VBegin { mode: TxMode::Deferred }));
    }

    #[test]
    fn rollback_to_savepoint_emits_savepoint_then_rollback_to() {
        let mut p = program();
        translate_rollback(&mut p, Some("s1")).unwrap();
        let out = p.build("ROLLBACK TO s1".to_string()).unwrap();
        assert!(matches!(&out.instructions[0], Insn::Savepoint { op: 0, name } if name == "s1"));
        assert!(matches!(&out.instructions[1], Insn::VRollbackTo { name } if name == "s1"));
    }

    #[test]
    fn plain_rollback_emits_vrollback_only() {
        let mut p = program();
        translate_rollback(&mut p, None).unwrap();
        let out = p.build("ROLLBACK".to_string()).unwrap();
        assert!(matches!(out.instructions[0], Insn::VRollback));
    }

    #[test]
    fn savepoint_and_release_use_op_codes_1_and_2() {
        let mut p = program();
        translate_savepoint(&mut p, "s1").unwrap();
        translate_release(&mut p, "s1").unwrap();
        let out = p.build("".to_string()).unwrap();
        assert!(matches!(&out.instructions[0], Insn::Savepoint { op: 1, .. }));
        assert!(matches!(&out.instructions[2], Insn::Savepoint { op: 2, .. }));
    }
}
