//! The peephole optimizer.
//!
//! Two bytecode transforms rewrite an executable image:
//!
//! 1. *String-stack bracket elimination.* The compiler brackets statements
//!    with `pushs`/`pops` so block exit restores the string stack. A pair
//!    with no instruction between it that can move `csp` is dead and is
//!    deleted. The set of runtime library calls recognized as `csp`
//!    movers is an explicit list; anything not provably harmless keeps
//!    the bracket.
//! 2. *Load/store index folding.* A `push k` immediately followed by an
//!    indexed frame access folds into the unindexed form with the
//!    constant added to the offset.
//!
//! Deleting instructions moves every following instruction, so the pass
//! re-encodes the whole program and remaps all absolute I-space
//! references: branch targets, `pcal` operands, the entry point, the
//! code addresses of procedure symbols and the line number records.

use alloc::vec::Vec;

use crate::insn::{self, lib_fn, op, Insn};
use crate::poff::sym_type;
use crate::read::{Error, PoffFile, ReadRef, Result};
use crate::write::{Object, Symbol};

/// The library calls that can move `csp`, keeping a bracket alive.
///
/// These are the string allocation and concatenation helpers; the list is
/// deliberately explicit so that a new library call defaults to keeping
/// brackets until it is proven harmless.
pub const DEFAULT_CSP_MOVERS: &[u16] = &[
    lib_fn::GETENV,
    lib_fn::STRINIT,
    lib_fn::SSTRINIT,
    lib_fn::STRTMP,
    lib_fn::MKSTKC,
    lib_fn::STRCAT,
    lib_fn::STRCATC,
    lib_fn::STRDUP,
    lib_fn::SUBSTR,
    lib_fn::BSTR2STR,
];

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u32,
    insn: Insn,
    keep: bool,
}

/// The peephole optimizer.
#[derive(Debug, Clone)]
pub struct Optimizer {
    csp_movers: Vec<u16>,
}

impl Optimizer {
    /// An optimizer with the default `csp`-mover list.
    pub fn new() -> Optimizer {
        Optimizer {
            csp_movers: DEFAULT_CSP_MOVERS.to_vec(),
        }
    }

    /// Replace the list of library calls treated as `csp` movers.
    pub fn with_csp_movers(mut self, movers: &[u16]) -> Optimizer {
        self.csp_movers = movers.to_vec();
        self
    }

    /// Rewrite an executable image, returning the optimized object.
    pub fn optimize<'data, R: ReadRef<'data>>(
        &self,
        file: &PoffFile<'data, R>,
    ) -> Result<Object> {
        let program = file.program();
        let mut slots = Vec::new();
        let mut offset = 0;
        while offset < program.len() {
            let (insn, next) =
                Insn::decode(program, offset).map_err(|()| Error("Truncated program section"))?;
            if !insn::is_defined(insn.op) {
                return Err(Error("Undefined opcode in program"));
            }
            slots.push(Slot {
                offset: offset as u32,
                insn,
                keep: true,
            });
            offset = next;
        }

        fold_indexed_access(&mut slots);
        self.prune_brackets(&mut slots);

        // Compute the old-to-new address mapping.
        let mut new_offsets = Vec::with_capacity(slots.len());
        let mut running = 0u32;
        for slot in &slots {
            new_offsets.push(running);
            if slot.keep {
                running += slot.insn.size() as u32;
            }
        }
        let end = running;
        let map_addr = |old: u32| -> u32 {
            match slots.binary_search_by_key(&old, |slot| slot.offset) {
                Ok(mut index) => {
                    // A deleted instruction maps to its surviving successor.
                    while index < slots.len() && !slots[index].keep {
                        index += 1;
                    }
                    if index < slots.len() {
                        new_offsets[index]
                    } else {
                        end
                    }
                }
                Err(_) => end,
            }
        };

        let mut output = Object::new(file.file_type(), file.module_name().unwrap_or(b""));
        output.set_entry_point(map_addr(file.entry_point().into()) as u16);
        output.append_rodata(file.rodata());

        for slot in &slots {
            if !slot.keep {
                continue;
            }
            let mut insn = slot.insn;
            if insn::is_branch(insn.op) || insn.op == op::PCAL {
                insn.arg2 = map_addr(insn.arg2.into()) as u16;
            }
            output.add_opcode(insn);
        }

        for (_, symbol) in file.symbols() {
            let mut value = symbol.value;
            if symbol.kind == sym_type::SYM_T_PROC && symbol.is_defined() {
                value = map_addr(value.into()) as u16;
            }
            output.add_symbol(Symbol {
                name: symbol.name.to_vec(),
                value,
                size: symbol.size,
                kind: symbol.kind,
                flags: symbol.flags,
                align: symbol.align,
            });
        }

        for line in file.raw_line_numbers() {
            let name = file
                .file_name(line.file)
                .ok_or(Error("Invalid line number file ordinal"))?;
            output.add_line_number(line.line, name, map_addr(line.offset));
        }

        Ok(output)
    }

    /// Delete `pushs`/`pops` pairs that provably leave `csp` unchanged.
    ///
    /// Anything that can move `csp` or leave the region keeps the pair:
    /// the recognized library calls, procedure calls, nested brackets and
    /// branches. Inner pairs are deleted first; the scan repeats until no
    /// pair can be removed.
    fn prune_brackets(&self, slots: &mut [Slot]) {
        loop {
            let mut changed = false;
            let mut index = 0;
            while index < slots.len() {
                if slots[index].keep && slots[index].insn.op == op::PUSHS {
                    if let Some(close) = self.removable_bracket(slots, index) {
                        slots[index].keep = false;
                        slots[close].keep = false;
                        changed = true;
                    }
                }
                index += 1;
            }
            if !changed {
                break;
            }
        }
    }

    /// If the bracket opened at `open` closes without any `csp` effect,
    /// return the index of the closing `pops`.
    fn removable_bracket(&self, slots: &[Slot], open: usize) -> Option<usize> {
        for (index, slot) in slots.iter().enumerate().skip(open + 1) {
            if !slot.keep {
                continue;
            }
            let insn = slot.insn;
            match insn.op {
                op::POPS => return Some(index),
                op::PUSHS | op::PCAL | op::RET | op::END => return None,
                op::LIB if self.csp_movers.contains(&insn.arg2) => return None,
                _ if insn::is_branch(insn.op) => return None,
                _ => {}
            }
        }
        None
    }
}

impl Default for Optimizer {
    fn default() -> Optimizer {
        Optimizer::new()
    }
}

/// Map an indexed access opcode to its unindexed form.
fn fold_target(opcode: u8) -> Option<u8> {
    Some(match opcode {
        op::LDX => op::LD,
        op::LDXH => op::LDH,
        op::LDXB => op::LDB,
        op::STX => op::ST,
        op::STXH => op::STH,
        op::STXB => op::STB,
        op::LAX => op::LA,
        op::LDSX => op::LDS,
        op::LDSXH => op::LDSH,
        op::LDSXB => op::LDSB,
        op::STSX => op::STS,
        op::STSXH => op::STSH,
        op::STSXB => op::STSB,
        op::LASX => op::LAS,
        // The multi-word forms pop their byte count above the index, so a
        // preceding push is the count, not the index.
        _ => return None,
    })
}

/// Fold `push k` into a following indexed access.
fn fold_indexed_access(slots: &mut [Slot]) {
    for index in 1..slots.len() {
        let (head, tail) = slots.split_at_mut(index);
        let previous = &mut head[index - 1];
        let current = &mut tail[0];
        if !previous.keep || !current.keep || previous.insn.op != op::PUSH {
            continue;
        }
        if let Some(folded) = fold_target(current.insn.op) {
            current.insn = Insn {
                op: folded,
                arg1: current.insn.arg1,
                arg2: current.insn.arg2.wrapping_add(previous.insn.arg2),
            };
            previous.keep = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poff::file_type;
    use crate::read::PoffFile;

    fn build(insns: &[Insn]) -> Object {
        let mut object = Object::new(file_type::FT_EXEC, b"t");
        for insn in insns {
            object.add_opcode(*insn);
        }
        object
    }

    fn optimize(insns: &[Insn]) -> Vec<Insn> {
        let data = build(insns).write_vec().unwrap();
        let file = PoffFile::parse(&*data).unwrap();
        let output = Optimizer::new().optimize(&file).unwrap();
        let mut decoded = Vec::new();
        let mut offset = 0;
        while offset < output.program().len() {
            let (insn, next) = Insn::decode(output.program(), offset).unwrap();
            decoded.push(insn);
            offset = next;
        }
        decoded
    }

    #[test]
    fn dead_bracket_is_deleted() {
        let result = optimize(&[
            Insn::bare(op::PUSHS),
            Insn::arg16(op::PUSH, 1),
            Insn::arg16(op::ST, 6),
            Insn::bare(op::POPS),
            Insn::arg16(op::PUSH, 0),
            Insn::bare(op::END),
        ]);
        assert_eq!(
            result,
            vec![
                Insn::arg16(op::PUSH, 1),
                Insn::arg16(op::ST, 6),
                Insn::arg16(op::PUSH, 0),
                Insn::bare(op::END),
            ]
        );
    }

    #[test]
    fn live_bracket_is_kept() {
        let insns = [
            Insn::bare(op::PUSHS),
            Insn::arg16(op::LIB, lib_fn::STRTMP),
            Insn::arg16(op::INDS, 0xFFFC),
            Insn::bare(op::POPS),
            Insn::arg16(op::PUSH, 0),
            Insn::bare(op::END),
        ];
        assert_eq!(optimize(&insns), insns.to_vec());
    }

    #[test]
    fn nested_brackets_collapse_inside_out() {
        let result = optimize(&[
            Insn::bare(op::PUSHS),
            Insn::bare(op::PUSHS),
            Insn::arg16(op::PUSH, 1),
            Insn::arg16(op::ST, 6),
            Insn::bare(op::POPS),
            Insn::bare(op::POPS),
            Insn::arg16(op::PUSH, 0),
            Insn::bare(op::END),
        ]);
        assert_eq!(
            result,
            vec![
                Insn::arg16(op::PUSH, 1),
                Insn::arg16(op::ST, 6),
                Insn::arg16(op::PUSH, 0),
                Insn::bare(op::END),
            ]
        );
    }

    #[test]
    fn index_folding_rewrites_branch_targets() {
        // The jump lands beyond the folded pair and must be rebased.
        let result = optimize(&[
            Insn::arg16(op::JMP, 9),          // over the next two
            Insn::arg16(op::PUSH, 4),         // 3..6: folded away
            Insn::arg16(op::LDX, 6),          // 6..9: becomes ld 10
            Insn::arg16(op::PUSH, 0),         // 9: jump target
            Insn::bare(op::END),
        ]);
        assert_eq!(
            result,
            vec![
                Insn::arg16(op::JMP, 6),
                Insn::arg16(op::LD, 10),
                Insn::arg16(op::PUSH, 0),
                Insn::bare(op::END),
            ]
        );
    }

    #[test]
    fn static_chain_fold_keeps_the_level() {
        let result = optimize(&[
            Insn::arg16(op::PUSH, 8),
            Insn::arg8_16(op::LDSX, 2, 4),
            Insn::arg16(op::PUSH, 0),
            Insn::bare(op::END),
        ]);
        assert_eq!(
            result,
            vec![
                Insn::arg8_16(op::LDS, 2, 12),
                Insn::arg16(op::PUSH, 0),
                Insn::bare(op::END),
            ]
        );
    }

    #[test]
    fn multiword_access_is_not_folded() {
        // Before ldxm the pushed constant is the byte count.
        let insns = [
            Insn::arg16(op::PUSH, 8),
            Insn::arg16(op::LDXM, 6),
            Insn::arg16(op::PUSH, 0),
            Insn::bare(op::END),
        ];
        assert_eq!(optimize(&insns), insns.to_vec());
    }

    #[test]
    fn configured_mover_list_is_respected() {
        let insns = [
            Insn::bare(op::PUSHS),
            Insn::arg16(op::LIB, lib_fn::STRTMP),
            Insn::arg16(op::INDS, 0xFFFC),
            Insn::bare(op::POPS),
            Insn::arg16(op::PUSH, 0),
            Insn::bare(op::END),
        ];
        let data = build(&insns).write_vec().unwrap();
        let file = PoffFile::parse(&*data).unwrap();
        // An (unsound) empty mover list deletes the pair.
        let output = Optimizer::new().with_csp_movers(&[]).optimize(&file).unwrap();
        let mut decoded = Vec::new();
        let mut offset = 0;
        while offset < output.program().len() {
            let (insn, next) = Insn::decode(output.program(), offset).unwrap();
            decoded.push(insn);
            offset = next;
        }
        assert!(!decoded.iter().any(|insn| insn.op == op::PUSHS));
    }
}
