//! Structural module: every pool in raw, index-addressed form
//!
//! Wire layout:
//! - Header: `"HLB"`, version byte, debug flag byte
//! - Counts (varints): ints, floats, strings, bytes (version >= 5), types,
//!   globals, natives, functions, constants, then the entry-point index
//! - Pools in the same order, with the debug file list after the byte pool
//!   when the debug flag is set

use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::debug::{decode_positions, encode_positions, DebugPosition};
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError, EncodeError};
use crate::opcode::Instruction;
use crate::types::TypeDef;

/// Magic marker for HashLink bytecode files: "HLB"
pub const MAGIC: [u8; 3] = *b"HLB";

/// Oldest supported version
pub const MIN_VERSION: u8 = 4;

/// Newest supported version
pub const MAX_VERSION: u8 = 5;

/// First version carrying the byte-block pool
pub const BYTES_POOL_VERSION: u8 = 5;

/// Module encoding/decoding errors
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Decode error
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),

    /// Encode error
    #[error("Encode error: {0}")]
    EncodeError(#[from] EncodeError),

    /// File could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid magic marker
    #[error("Invalid magic number: expected HLB, got {0:?}")]
    InvalidMagic([u8; 3]),

    /// Unsupported version
    #[error("Unsupported version: {0} (supported: {MIN_VERSION}..={MAX_VERSION})")]
    UnsupportedVersion(u8),

    /// Byte blocks present in a module whose version has no byte pool
    #[error("Version {0} modules cannot carry a byte pool")]
    BytesPoolUnsupported(u8),

    /// Debug table does not match the instruction list
    #[error("Function {function}: {positions} debug positions for {instructions} instructions")]
    DebugInfoMismatch {
        /// Function index
        function: usize,
        /// Debug positions present
        positions: usize,
        /// Instructions present
        instructions: usize,
    },
}

/// Host-implemented function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Native {
    /// Library name string index
    pub lib: usize,
    /// Function name string index
    pub name: usize,
    /// Function type index
    pub ty: usize,
    /// Function index (shared with methods)
    pub index: usize,
}

/// Local variable assignment record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarAssign {
    /// Variable name string index
    pub name: usize,
    /// Instruction position
    pub position: i32,
}

/// Bytecode-implemented function
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    /// Function type index
    pub ty: usize,
    /// Function index (shared with natives)
    pub index: usize,
    /// Register type indices
    pub registers: Vec<usize>,
    /// Instruction stream
    pub instructions: Vec<Instruction>,
    /// One position per instruction, present when the module has debug info
    pub debug: Option<Vec<DebugPosition>>,
    /// Variable assignments, present when the module has debug info
    pub assigns: Option<Vec<VarAssign>>,
}

impl Method {
    /// Insert an instruction, copying the debug position of its neighbour
    pub fn insert_instruction(&mut self, at: usize, instruction: Instruction) {
        self.instructions.insert(at, instruction);
        if let Some(debug) = &mut self.debug {
            let pos = debug
                .get(at)
                .or_else(|| at.checked_sub(1).and_then(|prev| debug.get(prev)))
                .copied()
                .unwrap_or_default();
            debug.insert(at.min(debug.len()), pos);
        }
    }

    /// Remove an instruction together with its debug position
    pub fn remove_instruction(&mut self, at: usize) -> Instruction {
        if let Some(debug) = &mut self.debug {
            if at < debug.len() {
                debug.remove(at);
            }
        }
        self.instructions.remove(at)
    }

    fn encode(&self, writer: &mut BytecodeWriter, has_debug: bool) -> Result<(), ModuleError> {
        writer.emit_index(self.ty)?;
        writer.emit_index(self.index)?;
        writer.emit_index(self.registers.len())?;
        writer.emit_index(self.instructions.len())?;

        for &register in &self.registers {
            writer.emit_index(register)?;
        }
        for instruction in &self.instructions {
            instruction.encode(writer)?;
        }

        if has_debug {
            let positions = self.debug.as_deref().unwrap_or_default();
            if positions.len() != self.instructions.len() {
                return Err(ModuleError::DebugInfoMismatch {
                    function: self.index,
                    positions: positions.len(),
                    instructions: self.instructions.len(),
                });
            }
            encode_positions(writer, positions)?;

            let assigns = self.assigns.as_deref().unwrap_or_default();
            writer.emit_index(assigns.len())?;
            for assign in assigns {
                writer.emit_index(assign.name)?;
                writer.emit_varint(assign.position)?;
            }
        }

        Ok(())
    }

    fn decode(reader: &mut BytecodeReader<'_>, has_debug: bool) -> Result<Self, DecodeError> {
        let ty = reader.read_index()?;
        let index = reader.read_index()?;
        let nregs = reader.read_count()?;
        let nops = reader.read_count()?;

        let mut registers = Vec::with_capacity(nregs);
        for _ in 0..nregs {
            registers.push(reader.read_index()?);
        }

        let mut instructions = Vec::new();
        for _ in 0..nops {
            instructions.push(Instruction::decode(reader)?);
        }

        let (debug, assigns) = if has_debug {
            let positions = decode_positions(reader, nops)?;
            let count = reader.read_count()?;
            let mut assigns = Vec::with_capacity(count);
            for _ in 0..count {
                let name = reader.read_index()?;
                let position = reader.read_varint()?;
                assigns.push(VarAssign { name, position });
            }
            (Some(positions), Some(assigns))
        } else {
            (None, None)
        };

        Ok(Self {
            ty,
            index,
            registers,
            instructions,
            debug,
            assigns,
        })
    }
}

/// Constant record: initial value of a global slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constant {
    /// Global slot index
    pub global: usize,
    /// Payload fields; for string constants `[string index, byte length]`
    pub fields: Vec<usize>,
}

/// A HashLink bytecode module in structural form
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Bytecode version
    pub version: u8,
    /// Whether functions carry debug tables
    pub has_debug: bool,
    /// 32-bit integer pool
    pub ints: Vec<i32>,
    /// 64-bit float pool
    pub floats: Vec<f64>,
    /// String pool
    pub strings: Vec<String>,
    /// Byte-block pool (version >= 5)
    pub bytes: Vec<Vec<u8>>,
    /// Source file names referenced by debug positions
    pub debug_files: Vec<String>,
    /// Type pool
    pub types: Vec<TypeDef>,
    /// Global slots, each holding a type index
    pub globals: Vec<usize>,
    /// Natives
    pub natives: Vec<Native>,
    /// Methods
    pub methods: Vec<Method>,
    /// Constants
    pub constants: Vec<Constant>,
    /// Entry-point function index
    pub entrypoint: usize,
}

impl Module {
    /// Create a new empty module
    pub fn new(version: u8) -> Self {
        Self {
            version,
            has_debug: false,
            ints: Vec::new(),
            floats: Vec::new(),
            strings: Vec::new(),
            bytes: Vec::new(),
            debug_files: Vec::new(),
            types: Vec::new(),
            globals: Vec::new(),
            natives: Vec::new(),
            methods: Vec::new(),
            constants: Vec::new(),
            entrypoint: 0,
        }
    }

    /// Whether this version carries the byte-block pool
    pub fn has_bytes_pool(&self) -> bool {
        self.version >= BYTES_POOL_VERSION
    }

    /// Size of the combined native + method index space
    pub fn function_count(&self) -> usize {
        self.natives.len() + self.methods.len()
    }

    /// Find a method by function index
    pub fn find_method(&self, index: usize) -> Option<&Method> {
        self.methods.iter().find(|m| m.index == index)
    }

    /// Find a method by function index, mutably
    pub fn find_method_mut(&mut self, index: usize) -> Option<&mut Method> {
        self.methods.iter_mut().find(|m| m.index == index)
    }

    /// Find a native by function index
    pub fn find_native(&self, index: usize) -> Option<&Native> {
        self.natives.iter().find(|n| n.index == index)
    }

    /// Read and decode a module file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModuleError> {
        let data = std::fs::read(path)?;
        Self::decode(&data)
    }

    /// Encode and write a module file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ModuleError> {
        let bytes = self.encode()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Encode the module to binary format
    pub fn encode(&self) -> Result<Vec<u8>, ModuleError> {
        if !self.has_bytes_pool() && !self.bytes.is_empty() {
            return Err(ModuleError::BytesPoolUnsupported(self.version));
        }

        let mut writer = BytecodeWriter::new();

        writer.emit_bytes(&MAGIC);
        writer.emit_u8(self.version);
        writer.emit_u8(self.has_debug as u8);

        writer.emit_index(self.ints.len())?;
        writer.emit_index(self.floats.len())?;
        writer.emit_index(self.strings.len())?;
        if self.has_bytes_pool() {
            writer.emit_index(self.bytes.len())?;
        }
        writer.emit_index(self.types.len())?;
        writer.emit_index(self.globals.len())?;
        writer.emit_index(self.natives.len())?;
        writer.emit_index(self.methods.len())?;
        writer.emit_index(self.constants.len())?;
        writer.emit_index(self.entrypoint)?;

        for &value in &self.ints {
            writer.emit_i32(value);
        }
        for &value in &self.floats {
            writer.emit_f64(value);
        }
        writer.emit_string_pool(&self.strings)?;
        if self.has_bytes_pool() {
            writer.emit_bytes_pool(&self.bytes)?;
        }

        if self.has_debug {
            writer.emit_index(self.debug_files.len())?;
            writer.emit_string_pool(&self.debug_files)?;
        }

        for ty in &self.types {
            ty.encode(&mut writer)?;
        }
        for &global in &self.globals {
            writer.emit_index(global)?;
        }
        for native in &self.natives {
            writer.emit_index(native.lib)?;
            writer.emit_index(native.name)?;
            writer.emit_index(native.ty)?;
            writer.emit_index(native.index)?;
        }
        for method in &self.methods {
            method.encode(&mut writer, self.has_debug)?;
        }
        for constant in &self.constants {
            writer.emit_index(constant.global)?;
            writer.emit_index(constant.fields.len())?;
            for &field in &constant.fields {
                writer.emit_index(field)?;
            }
        }

        Ok(writer.into_bytes())
    }

    /// Decode a module from binary format
    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        let mut reader = BytecodeReader::new(data);

        let magic = reader.read_slice(3)?;
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic([magic[0], magic[1], magic[2]]));
        }

        let version = reader.read_u8()?;
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(ModuleError::UnsupportedVersion(version));
        }
        let has_debug = reader.read_u8()? != 0;
        let mut module = Self::new(version);
        module.has_debug = has_debug;

        let nints = reader.read_count()?;
        let nfloats = reader.read_count()?;
        let nstrings = reader.read_count()?;
        let nbytes = if module.has_bytes_pool() {
            reader.read_count()?
        } else {
            0
        };
        let ntypes = reader.read_count()?;
        let nglobals = reader.read_count()?;
        let nnatives = reader.read_count()?;
        let nfunctions = reader.read_count()?;
        let nconstants = reader.read_count()?;
        module.entrypoint = reader.read_index()?;

        module.ints.reserve(nints);
        for _ in 0..nints {
            module.ints.push(reader.read_i32()?);
        }
        module.floats.reserve(nfloats);
        for _ in 0..nfloats {
            module.floats.push(reader.read_f64()?);
        }
        module.strings = reader.read_string_pool(nstrings)?;
        if module.has_bytes_pool() {
            module.bytes = reader.read_bytes_pool(nbytes)?;
        }

        if has_debug {
            let nfiles = reader.read_count()?;
            module.debug_files = reader.read_string_pool(nfiles)?;
        }

        for _ in 0..ntypes {
            module.types.push(TypeDef::decode(&mut reader)?);
        }
        module.globals.reserve(nglobals);
        for _ in 0..nglobals {
            module.globals.push(reader.read_index()?);
        }
        for _ in 0..nnatives {
            let lib = reader.read_index()?;
            let name = reader.read_index()?;
            let ty = reader.read_index()?;
            let index = reader.read_index()?;
            module.natives.push(Native {
                lib,
                name,
                ty,
                index,
            });
        }
        for _ in 0..nfunctions {
            module.methods.push(Method::decode(&mut reader, has_debug)?);
        }
        for _ in 0..nconstants {
            let global = reader.read_index()?;
            let count = reader.read_count()?;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(reader.read_index()?);
            }
            module.constants.push(Constant { global, fields });
        }

        debug!(
            version,
            types = module.types.len(),
            natives = module.natives.len(),
            methods = module.methods.len(),
            strings = module.strings.len(),
            "decoded module"
        );

        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use crate::types::FunSignature;

    fn sample_module(version: u8, has_debug: bool) -> Module {
        let mut module = Module::new(version);
        module.has_debug = has_debug;
        module.ints = vec![0, 42, -7];
        module.floats = vec![1.5];
        module.strings = vec!["std".into(), "log".into(), "main".into()];
        if version >= BYTES_POOL_VERSION {
            module.bytes = vec![vec![1, 2], vec![3]];
        }
        if has_debug {
            module.debug_files = vec!["Main.hx".into()];
        }
        module.types = vec![
            TypeDef::Void,
            TypeDef::I32,
            TypeDef::Fun(FunSignature { args: vec![], ret: 0 }),
        ];
        module.globals = vec![1];
        module.natives = vec![Native {
            lib: 0,
            name: 1,
            ty: 2,
            index: 0,
        }];
        module.methods = vec![Method {
            ty: 2,
            index: 1,
            registers: vec![1, 0],
            instructions: vec![
                Instruction::new(Opcode::Int, vec![0, 1]),
                Instruction::new(Opcode::Call0, vec![1, 0]),
                Instruction::new(Opcode::Ret, vec![1]),
            ],
            debug: has_debug.then(|| {
                vec![
                    DebugPosition::new(0, 3),
                    DebugPosition::new(0, 3),
                    DebugPosition::new(0, 4),
                ]
            }),
            assigns: has_debug.then(|| vec![VarAssign { name: 2, position: -1 }]),
        }];
        module.constants = vec![Constant {
            global: 0,
            fields: vec![2, 4],
        }];
        module.entrypoint = 1;
        module
    }

    #[test]
    fn test_module_roundtrip() {
        for (version, has_debug) in [(4, false), (4, true), (5, false), (5, true)] {
            let module = sample_module(version, has_debug);
            let bytes = module.encode().unwrap();
            let decoded = Module::decode(&bytes).unwrap();
            assert_eq!(decoded, module, "version {} debug {}", version, has_debug);
            assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn test_header_layout() {
        let module = Module::new(5);
        let bytes = module.encode().unwrap();
        assert_eq!(&bytes[..5], b"HLB\x05\x00");
        // nine zero counts plus entry point 0, then empty string and byte pools
        assert_eq!(&bytes[5..15], &[0; 10]);
        assert_eq!(&bytes[15..], &[0; 8]);

        let v4 = Module::new(4).encode().unwrap();
        assert_eq!(v4.len(), bytes.len() - 5);
    }

    #[test]
    fn test_invalid_magic_number() {
        let result = Module::decode(b"HLX\x05\x00");
        assert!(matches!(result, Err(ModuleError::InvalidMagic(m)) if &m == b"HLX"));
    }

    #[test]
    fn test_unsupported_version() {
        for version in [3u8, 6] {
            let mut bytes = Module::new(5).encode().unwrap();
            bytes[3] = version;
            let result = Module::decode(&bytes);
            assert!(matches!(result, Err(ModuleError::UnsupportedVersion(v)) if v == version));
        }
    }

    #[test]
    fn test_truncated_module() {
        let bytes = sample_module(5, true).encode().unwrap();
        for cut in [2, 6, bytes.len() / 2, bytes.len() - 1] {
            let result = Module::decode(&bytes[..cut]);
            assert!(matches!(result, Err(ModuleError::DecodeError(_))), "cut at {}", cut);
        }
    }

    #[test]
    fn test_bytes_pool_version_gate() {
        let mut module = Module::new(4);
        module.bytes = vec![vec![1]];
        assert!(matches!(module.encode(), Err(ModuleError::BytesPoolUnsupported(4))));
    }

    #[test]
    fn test_debug_mismatch_rejected() {
        let mut module = sample_module(5, true);
        module.methods[0].instructions.push(Instruction::new(Opcode::Nop, vec![]));
        assert!(matches!(
            module.encode(),
            Err(ModuleError::DebugInfoMismatch { function: 1, positions: 3, instructions: 4 })
        ));
    }

    #[test]
    fn test_insert_and_remove_keep_debug_aligned() {
        let mut module = sample_module(5, true);
        let method = module.find_method_mut(1).unwrap();

        method.insert_instruction(1, Instruction::new(Opcode::Nop, vec![]));
        method.insert_instruction(4, Instruction::new(Opcode::Label, vec![]));
        assert_eq!(method.instructions.len(), 5);
        assert_eq!(method.debug.as_ref().unwrap().len(), 5);
        assert_eq!(method.debug.as_ref().unwrap()[4], DebugPosition::new(0, 4));

        let removed = method.remove_instruction(1);
        assert_eq!(removed.opcode, Opcode::Nop);
        assert_eq!(method.debug.as_ref().unwrap().len(), 4);

        module.encode().unwrap();
    }

    #[test]
    fn test_function_lookup() {
        let module = sample_module(5, false);
        assert_eq!(module.function_count(), 2);
        assert!(module.find_native(0).is_some());
        assert!(module.find_method(0).is_none());
        assert!(module.find_method(1).is_some());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.hl");

        let module = sample_module(5, true);
        module.write_to_file(&path).unwrap();
        assert_eq!(Module::from_file(&path).unwrap(), module);

        let missing = Module::from_file(dir.path().join("missing.hl"));
        assert!(matches!(missing, Err(ModuleError::Io(_))));
    }
}
