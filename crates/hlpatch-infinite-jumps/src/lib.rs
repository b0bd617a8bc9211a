//! Example patch plugin
//!
//! Makes `get_airJumps` report zero jumps used, so the player can jump in
//! mid-air without limit. The getter loads the counter with a `Field`
//! instruction at position 2; the patch swaps it for a constant 0.
//!
//! Build with `cargo build -p hlpatch-infinite-jumps` and pass the resulting
//! library to `hlpatch --patch`.

use hlpatch_bytecode::graph::{FunctionId, Op};
use hlpatch_bytecode::patch::PatchLogger;
use hlpatch_bytecode::{Graph, Instruction, Module, Opcode, Patch, PatchError, PatchInfo};

/// Name of the patched getter
pub const GETTER: &str = "get_airJumps";

/// Position of the counter load inside the getter
pub const COUNTER_LOAD: usize = 2;

/// Air jump counter patch
#[derive(Debug, Default)]
pub struct InfiniteJumps;

impl InfiniteJumps {
    fn find_getter(graph: &Graph, log: &PatchLogger<'_>) -> Option<FunctionId> {
        let found = graph
            .method_ids()
            .find(|&id| graph.method(id).and_then(|m| m.name.as_deref()) == Some(GETTER));
        if found.is_none() {
            log.error(&format!("{} not found", GETTER));
        }
        found
    }
}

impl Patch for InfiniteJumps {
    fn info(&self) -> PatchInfo {
        PatchInfo::new("Infinite Jumps", "hlpatch", "1.0")
    }

    fn patch_resolved(
        &self,
        _module: &Module,
        graph: &mut Graph,
        log: &PatchLogger<'_>,
    ) -> Result<(), PatchError> {
        let Some(id) = Self::find_getter(graph, log) else {
            return Ok(());
        };
        let method = graph
            .method_mut(id)
            .ok_or_else(|| PatchError::failed(format!("function {} is not a method", id.0)))?;

        let dst = match method.ops.get(COUNTER_LOAD) {
            Some(Op::Field { dst, .. }) => *dst,
            other => {
                return Err(PatchError::failed(format!(
                    "expected a field load at {} in {}, found {:?}",
                    COUNTER_LOAD, GETTER, other
                )))
            }
        };
        method.ops[COUNTER_LOAD] = Op::Int { dst, value: 0 };

        log.info(&format!("{} now returns 0", GETTER));
        Ok(())
    }

    fn patch_raw(
        &self,
        module: &mut Module,
        graph: &Graph,
        log: &PatchLogger<'_>,
    ) -> Result<(), PatchError> {
        let Some(id) = Self::find_getter(graph, log) else {
            return Ok(());
        };

        let zero = match module.ints.iter().position(|&v| v == 0) {
            Some(index) => index,
            None => {
                module.ints.push(0);
                module.ints.len() - 1
            }
        };

        let method = module
            .find_method_mut(id.0)
            .ok_or_else(|| PatchError::failed(format!("function {} is not a method", id.0)))?;
        let load = method.instructions.get(COUNTER_LOAD);
        let dst = load
            .filter(|load| load.opcode == Opcode::Field)
            .and_then(|load| load.args.first().copied())
            .ok_or_else(|| {
                PatchError::failed(format!(
                    "expected a field load at {} in {}, found {:?}",
                    COUNTER_LOAD, GETTER, load
                ))
            })?;
        method.instructions[COUNTER_LOAD] = Instruction::new(Opcode::Int, vec![dst, zero as i32]);

        log.info(&format!("{} now returns int #{}", GETTER, zero));
        Ok(())
    }
}

hlpatch_bytecode::export_patch!(InfiniteJumps);
