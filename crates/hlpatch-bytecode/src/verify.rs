//! Structural verification
//!
//! Checks every index a [`Module`] holds against the pool it points into.
//! A module that passes can be resolved into a graph and loaded by the
//! runtime without out-of-bounds lookups.

use std::collections::HashSet;
use std::fmt;

use crate::module::{Method, Module};
use crate::opcode::OperandKind;
use crate::types::{FunSignature, ObjDef, ObjField, TypeDef};

/// Bytecode verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Index outside its pool
    #[error("{location}: {pool} index {index} out of range (pool size {len})")]
    IndexOutOfRange {
        /// Where the index was found
        location: Location,
        /// Pool name
        pool: &'static str,
        /// Offending index
        index: i64,
        /// Pool size
        len: usize,
    },

    /// Register outside the function's register list
    #[error("{location}: register {register} out of range ({count} registers)")]
    InvalidRegister {
        /// Where the register was found
        location: Location,
        /// Offending register
        register: i32,
        /// Register count
        count: usize,
    },

    /// Branch to a position outside the function
    #[error("{location}: jump target {target} out of range ({count} instructions)")]
    InvalidJumpTarget {
        /// Jump instruction
        location: Location,
        /// Absolute target
        target: i64,
        /// Instruction count
        count: usize,
    },

    /// Two functions share an index
    #[error("Duplicate function index {0}")]
    DuplicateFunction(usize),

    /// A function index outside `0..natives + methods`
    #[error("Function index {index} outside the index space of {count} functions")]
    FunctionIndexGap {
        /// Offending index
        index: usize,
        /// Combined function count
        count: usize,
    },
}

/// Position of an index inside a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Module header
    Header,
    /// Type pool entry
    Type(usize),
    /// Global slot
    Global(usize),
    /// Native record
    Native(usize),
    /// Function header or register list
    Function(usize),
    /// Instruction of a function
    Instruction {
        /// Function index
        function: usize,
        /// Instruction position
        position: usize,
    },
    /// Constant record
    Constant(usize),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => write!(f, "header"),
            Self::Type(i) => write!(f, "type {}", i),
            Self::Global(i) => write!(f, "global {}", i),
            Self::Native(i) => write!(f, "native {}", i),
            Self::Function(i) => write!(f, "function {}", i),
            Self::Instruction { function, position } => {
                write!(f, "function {} instruction {}", function, position)
            }
            Self::Constant(i) => write!(f, "constant {}", i),
        }
    }
}

/// Verify a module's indices
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    let verifier = Verifier { module };

    verifier.function_indices()?;
    verifier.check(Location::Header, "function", module.entrypoint, module.function_count())?;

    for (i, ty) in module.types.iter().enumerate() {
        verifier.type_def(i, ty)?;
    }
    for (i, &global) in module.globals.iter().enumerate() {
        verifier.type_index(Location::Global(i), global)?;
    }
    for (i, native) in module.natives.iter().enumerate() {
        let location = Location::Native(i);
        verifier.string(location.clone(), native.lib)?;
        verifier.string(location.clone(), native.name)?;
        verifier.type_index(location, native.ty)?;
    }
    for method in &module.methods {
        verifier.method(method)?;
    }
    for (i, constant) in module.constants.iter().enumerate() {
        let location = Location::Constant(i);
        verifier.check(location.clone(), "global", constant.global, module.globals.len())?;
        if let Some(&string) = constant.fields.first() {
            verifier.string(location, string)?;
        }
    }

    Ok(())
}

struct Verifier<'m> {
    module: &'m Module,
}

impl Verifier<'_> {
    fn check(&self, location: Location, pool: &'static str, index: usize, len: usize) -> Result<(), VerifyError> {
        if index < len {
            Ok(())
        } else {
            Err(VerifyError::IndexOutOfRange {
                location,
                pool,
                index: index as i64,
                len,
            })
        }
    }

    fn check_raw(&self, location: Location, pool: &'static str, index: i32, len: usize) -> Result<(), VerifyError> {
        match usize::try_from(index) {
            Ok(i) if i < len => Ok(()),
            _ => Err(VerifyError::IndexOutOfRange {
                location,
                pool,
                index: index as i64,
                len,
            }),
        }
    }

    fn type_index(&self, location: Location, index: usize) -> Result<(), VerifyError> {
        self.check(location, "type", index, self.module.types.len())
    }

    fn string(&self, location: Location, index: usize) -> Result<(), VerifyError> {
        self.check(location, "string", index, self.module.strings.len())
    }

    /// 1-based global slot, 0 meaning none
    fn global_slot(&self, location: Location, slot: usize) -> Result<(), VerifyError> {
        match slot.checked_sub(1) {
            Some(global) => self.check(location, "global", global, self.module.globals.len()),
            None => Ok(()),
        }
    }

    fn function_indices(&self) -> Result<(), VerifyError> {
        let count = self.module.function_count();
        let mut seen = HashSet::with_capacity(count);
        let indices = self
            .module
            .natives
            .iter()
            .map(|n| n.index)
            .chain(self.module.methods.iter().map(|m| m.index));

        for index in indices {
            if index >= count {
                return Err(VerifyError::FunctionIndexGap { index, count });
            }
            if !seen.insert(index) {
                return Err(VerifyError::DuplicateFunction(index));
            }
        }
        Ok(())
    }

    fn signature(&self, location: &Location, sig: &FunSignature) -> Result<(), VerifyError> {
        for &arg in &sig.args {
            self.type_index(location.clone(), arg)?;
        }
        self.type_index(location.clone(), sig.ret)
    }

    fn fields(&self, location: &Location, fields: &[ObjField]) -> Result<(), VerifyError> {
        for field in fields {
            self.string(location.clone(), field.name)?;
            self.type_index(location.clone(), field.ty)?;
        }
        Ok(())
    }

    fn obj(&self, location: &Location, obj: &ObjDef) -> Result<(), VerifyError> {
        let functions = self.module.function_count();

        self.string(location.clone(), obj.name)?;
        if let Some(parent) = obj.superclass() {
            self.type_index(location.clone(), parent)?;
        }
        self.global_slot(location.clone(), obj.global)?;
        self.fields(location, &obj.fields)?;
        for proto in &obj.protos {
            self.string(location.clone(), proto.name)?;
            self.check(location.clone(), "function", proto.function, functions)?;
        }
        for binding in &obj.bindings {
            self.check(location.clone(), "function", binding.function, functions)?;
        }
        Ok(())
    }

    fn type_def(&self, index: usize, ty: &TypeDef) -> Result<(), VerifyError> {
        let location = Location::Type(index);
        match ty {
            TypeDef::Fun(sig) | TypeDef::Method(sig) => self.signature(&location, sig),
            TypeDef::Obj(obj) | TypeDef::Struct(obj) => self.obj(&location, obj),
            TypeDef::Ref(inner) | TypeDef::Null(inner) | TypeDef::Packed(inner) => {
                self.type_index(location, *inner)
            }
            TypeDef::Virtual(fields) => self.fields(&location, fields),
            TypeDef::Abstract(name) => self.string(location, *name),
            TypeDef::Enum(def) => {
                self.string(location.clone(), def.name)?;
                self.global_slot(location.clone(), def.global)?;
                for construct in &def.constructs {
                    self.string(location.clone(), construct.name)?;
                    for &param in &construct.params {
                        self.type_index(location.clone(), param)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn method(&self, method: &Method) -> Result<(), VerifyError> {
        let module = self.module;
        let header = Location::Function(method.index);

        self.type_index(header.clone(), method.ty)?;
        for &register in &method.registers {
            self.type_index(header.clone(), register)?;
        }

        let count = method.instructions.len();
        let bytes_len = if module.has_bytes_pool() {
            module.bytes.len()
        } else {
            module.strings.len()
        };

        for (position, instruction) in method.instructions.iter().enumerate() {
            let location = Location::Instruction {
                function: method.index,
                position,
            };

            for (slot, &arg) in instruction.args.iter().enumerate() {
                let location = location.clone();
                match instruction.opcode.operand_kind(slot) {
                    OperandKind::Reg => {
                        if usize::try_from(arg).map_or(true, |r| r >= method.registers.len()) {
                            return Err(VerifyError::InvalidRegister {
                                location,
                                register: arg,
                                count: method.registers.len(),
                            });
                        }
                    }
                    OperandKind::Int => self.check_raw(location, "int", arg, module.ints.len())?,
                    OperandKind::Float => self.check_raw(location, "float", arg, module.floats.len())?,
                    OperandKind::Bytes => self.check_raw(location, "bytes", arg, bytes_len)?,
                    OperandKind::String => self.check_raw(location, "string", arg, module.strings.len())?,
                    OperandKind::Function => {
                        self.check_raw(location, "function", arg, module.function_count())?
                    }
                    OperandKind::Global => self.check_raw(location, "global", arg, module.globals.len())?,
                    OperandKind::Type => self.check_raw(location, "type", arg, module.types.len())?,
                    OperandKind::Offset => {
                        let target = position as i64 + 1 + arg as i64;
                        if target < 0 || target >= count as i64 {
                            return Err(VerifyError::InvalidJumpTarget {
                                location,
                                target,
                                count,
                            });
                        }
                    }
                    OperandKind::Field | OperandKind::Construct | OperandKind::Inline => {}
                }
            }
        }

        if let Some(debug) = &method.debug {
            for pos in debug {
                self.check_raw(header.clone(), "debug file", pos.file, module.debug_files.len())?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::DebugPosition;
    use crate::module::{Constant, Native};
    use crate::opcode::{Instruction, Opcode};
    use crate::types::{ObjProto, TypeDef};

    fn valid_module() -> Module {
        let mut module = Module::new(5);
        module.ints = vec![7];
        module.strings = vec!["std".into(), "print".into(), "Main".into()];
        module.bytes = vec![vec![0xFF]];
        module.types = vec![
            TypeDef::Void,
            TypeDef::I32,
            TypeDef::Fun(FunSignature { args: vec![1], ret: 0 }),
            TypeDef::Obj(ObjDef {
                name: 2,
                super_type: -1,
                global: 1,
                fields: vec![ObjField { name: 1, ty: 1 }],
                protos: vec![ObjProto {
                    name: 1,
                    function: 1,
                    pindex: -1,
                }],
                bindings: vec![],
            }),
        ];
        module.globals = vec![3];
        module.natives = vec![Native {
            lib: 0,
            name: 1,
            ty: 2,
            index: 0,
        }];
        module.methods = vec![Method {
            ty: 2,
            index: 1,
            registers: vec![1, 1],
            instructions: vec![
                Instruction::new(Opcode::Int, vec![1, 0]),
                Instruction::new(Opcode::JSLt, vec![0, 1, 1]),
                Instruction::new(Opcode::Call1, vec![1, 0, 0]),
                Instruction::new(Opcode::Bytes, vec![1, 0]),
                Instruction::new(Opcode::Ret, vec![1]),
            ],
            debug: None,
            assigns: None,
        }];
        module.constants = vec![Constant {
            global: 0,
            fields: vec![2, 4],
        }];
        module.entrypoint = 1;
        module
    }

    #[test]
    fn test_valid_module_passes() {
        verify_module(&valid_module()).unwrap();
        verify_module(&Module::new(4)).unwrap_err();
    }

    #[test]
    fn test_bad_entrypoint() {
        let mut module = valid_module();
        module.entrypoint = 2;
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::IndexOutOfRange { location: Location::Header, pool: "function", .. })
        ));
    }

    #[test]
    fn test_duplicate_and_gap_function_indices() {
        let mut module = valid_module();
        module.methods[0].index = 0;
        assert!(matches!(verify_module(&module), Err(VerifyError::DuplicateFunction(0))));

        module.methods[0].index = 5;
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::FunctionIndexGap { index: 5, count: 2 })
        ));
    }

    #[test]
    fn test_type_references() {
        let mut module = valid_module();
        module.types[2] = TypeDef::Fun(FunSignature { args: vec![9], ret: 0 });
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::IndexOutOfRange { location: Location::Type(2), pool: "type", index: 9, .. })
        ));

        let mut module = valid_module();
        if let TypeDef::Obj(obj) = &mut module.types[3] {
            obj.global = 2;
        }
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::IndexOutOfRange { pool: "global", index: 1, .. })
        ));
    }

    #[test]
    fn test_instruction_operands() {
        let mut module = valid_module();
        module.methods[0].instructions[0] = Instruction::new(Opcode::Int, vec![1, 3]);
        let err = verify_module(&module).unwrap_err();
        assert_eq!(
            err.to_string(),
            "function 1 instruction 0: int index 3 out of range (pool size 1)"
        );

        let mut module = valid_module();
        module.methods[0].instructions[4] = Instruction::new(Opcode::Ret, vec![2]);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::InvalidRegister { register: 2, count: 2, .. })
        ));

        let mut module = valid_module();
        module.methods[0].instructions[2] = Instruction::new(Opcode::Call1, vec![1, 2, 0]);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::IndexOutOfRange { pool: "function", index: 2, .. })
        ));
    }

    #[test]
    fn test_jump_targets() {
        let mut module = valid_module();
        module.methods[0].instructions[1] = Instruction::new(Opcode::JSLt, vec![0, 1, 3]);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::InvalidJumpTarget { target: 5, count: 5, .. })
        ));

        module.methods[0].instructions[1] = Instruction::new(Opcode::JAlways, vec![-3]);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::InvalidJumpTarget { target: -1, .. })
        ));

        module.methods[0].instructions[1] = Instruction::new(Opcode::Switch, vec![0, 1, 2, -2]);
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_bytes_operand_before_version_5() {
        let mut module = valid_module();
        module.version = 4;
        module.bytes.clear();
        verify_module(&module).unwrap();

        module.methods[0].instructions[3] = Instruction::new(Opcode::Bytes, vec![1, 3]);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::IndexOutOfRange { pool: "bytes", index: 3, len: 3, .. })
        ));
    }

    #[test]
    fn test_debug_files() {
        let mut module = valid_module();
        module.has_debug = true;
        module.debug_files = vec!["Main.hx".into()];
        module.methods[0].debug = Some(vec![DebugPosition::new(0, 1); 5]);
        module.methods[0].assigns = Some(vec![]);
        verify_module(&module).unwrap();

        module.methods[0].debug = Some(vec![DebugPosition::new(1, 1); 5]);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::IndexOutOfRange { pool: "debug file", .. })
        ));
    }
}
