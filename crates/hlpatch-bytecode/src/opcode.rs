//! HashLink opcodes and the raw instruction codec
//!
//! A raw instruction is an opcode tag followed by a flat list of integer
//! arguments. The number of arguments comes from a per-opcode arity table:
//! positive entries are fixed counts, negative entries are a fixed prefix
//! followed by a counted list of registers. `Switch` has its own layout.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError, EncodeError};

/// Number of defined opcodes
pub const OPCODE_COUNT: usize = 101;

/// Arity entry reserved for `Switch`; the generic codec path must never see it
const SWITCH_ARITY: i8 = i8::MAX;

/// Argument arity per opcode tag
///
/// Negative values: `abs` fixed arguments, then a varint count and that many
/// registers.
const ARITY: [i8; OPCODE_COUNT] = [
    2, 2, 2, 2, 2, 2, 1, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, // Mov..Xor
    2, 2, 1, 1, 2, 3, 4, 5, 6, -2, -2, -2, -2, 2, 3, 3, 2, 2, 3, 3, // Neg..SetField
    2, 2, 3, 3, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 1, 2, // GetThis..ToDyn
    2, 2, 2, 2, 2, 2, 0, 1, 1, 1, SWITCH_ARITY, 1, 2, 1, 3, 3, 3, 3, 3, 3, // ToSFloat..SetI16
    3, 3, 1, 2, 2, 2, 2, 2, 2, 2, -2, 2, 2, 4, 3, 0, 2, 3, 0, 3, // SetMem..Prefetch
    3, // Asm
];

/// HashLink opcode enumeration
///
/// The discriminant is the wire tag. Operand descriptions use `dst`/`a`/`b`
/// for registers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Moves & Constants =====
    /// `dst = src`
    Mov = 0,
    /// `dst = ints[index]`
    Int = 1,
    /// `dst = floats[index]`
    Float = 2,
    /// `dst = value != 0`
    Bool = 3,
    /// `dst = bytes[index]`
    Bytes = 4,
    /// `dst = strings[index]`
    String = 5,
    /// `dst = null`
    Null = 6,

    // ===== Arithmetic =====
    /// `dst = a + b`
    Add = 7,
    /// `dst = a - b`
    Sub = 8,
    /// `dst = a * b`
    Mul = 9,
    /// Signed division
    SDiv = 10,
    /// Unsigned division
    UDiv = 11,
    /// Signed modulo
    SMod = 12,
    /// Unsigned modulo
    UMod = 13,
    /// Shift left
    Shl = 14,
    /// Arithmetic shift right
    SShr = 15,
    /// Logical shift right
    UShr = 16,
    /// Bitwise and
    And = 17,
    /// Bitwise or
    Or = 18,
    /// Bitwise xor
    Xor = 19,
    /// `dst = -a`
    Neg = 20,
    /// `dst = !a`
    Not = 21,
    /// `dst += 1`
    Incr = 22,
    /// `dst -= 1`
    Decr = 23,

    // ===== Calls =====
    /// `dst = fun()`
    Call0 = 24,
    /// `dst = fun(a)`
    Call1 = 25,
    /// `dst = fun(a, b)`
    Call2 = 26,
    /// `dst = fun(a, b, c)`
    Call3 = 27,
    /// `dst = fun(a, b, c, d)`
    Call4 = 28,
    /// `dst = fun(args...)`
    CallN = 29,
    /// `dst = args[0].proto[field](args...)`
    CallMethod = 30,
    /// `dst = this.proto[field](args...)`
    CallThis = 31,
    /// `dst = closure(args...)`
    CallClosure = 32,

    // ===== Closures =====
    /// `dst = fun`
    StaticClosure = 33,
    /// `dst = fun` bound to `obj`
    InstanceClosure = 34,
    /// `dst = obj.field` as a closure
    VirtualClosure = 35,

    // ===== Globals & Fields =====
    /// `dst = globals[index]`
    GetGlobal = 36,
    /// `globals[index] = src`
    SetGlobal = 37,
    /// `dst = obj.field`
    Field = 38,
    /// `obj.field = src`
    SetField = 39,
    /// `dst = this.field`
    GetThis = 40,
    /// `this.field = src`
    SetThis = 41,
    /// `dst = obj[name]` on a dynamic object
    DynGet = 42,
    /// `obj[name] = src` on a dynamic object
    DynSet = 43,

    // ===== Jumps =====
    /// Jump if true
    JTrue = 44,
    /// Jump if false
    JFalse = 45,
    /// Jump if null
    JNull = 46,
    /// Jump if not null
    JNotNull = 47,
    /// Jump if `a < b` (signed)
    JSLt = 48,
    /// Jump if `a >= b` (signed)
    JSGte = 49,
    /// Jump if `a > b` (signed)
    JSGt = 50,
    /// Jump if `a <= b` (signed)
    JSLte = 51,
    /// Jump if `a < b` (unsigned)
    JULt = 52,
    /// Jump if `a >= b` (unsigned)
    JUGte = 53,
    /// Jump if not `a < b`
    JNotLt = 54,
    /// Jump if not `a >= b`
    JNotGte = 55,
    /// Jump if equal
    JEq = 56,
    /// Jump if not equal
    JNotEq = 57,
    /// Unconditional jump
    JAlways = 58,

    // ===== Conversions =====
    /// Box to dynamic
    ToDyn = 59,
    /// Signed integer to float
    ToSFloat = 60,
    /// Unsigned integer to float
    ToUFloat = 61,
    /// Float to integer
    ToInt = 62,
    /// Checked cast
    SafeCast = 63,
    /// Unchecked cast
    UnsafeCast = 64,
    /// Cast to a virtual
    ToVirtual = 65,

    // ===== Control Flow =====
    /// Jump target marker
    Label = 66,
    /// Return a register
    Ret = 67,
    /// Throw a register
    Throw = 68,
    /// Rethrow a register
    Rethrow = 69,
    /// Multi-way branch: `reg, count, offsets..., default`
    Switch = 70,
    /// Throw if null
    NullCheck = 71,
    /// Install an exception trap
    Trap = 72,
    /// Remove an exception trap
    EndTrap = 73,

    // ===== Memory =====
    /// Load i8 from bytes
    GetI8 = 74,
    /// Load i16 from bytes
    GetI16 = 75,
    /// Load from memory
    GetMem = 76,
    /// Load array element
    GetArray = 77,
    /// Store i8 into bytes
    SetI8 = 78,
    /// Store i16 into bytes
    SetI16 = 79,
    /// Store to memory
    SetMem = 80,
    /// Store array element
    SetArray = 81,

    // ===== Objects & Types =====
    /// Allocate an instance of the register's type
    New = 82,
    /// Array length
    ArraySize = 83,
    /// `dst = types[index]`
    Type = 84,
    /// Runtime type of a value
    GetType = 85,
    /// Type id of a type value
    GetTID = 86,
    /// Take a reference to a register
    Ref = 87,
    /// Read through a reference
    Unref = 88,
    /// Write through a reference
    Setref = 89,

    // ===== Enums =====
    /// Build an enum value: `dst, construct, args...`
    MakeEnum = 90,
    /// Allocate an enum value with default fields
    EnumAlloc = 91,
    /// Constructor index of an enum value
    EnumIndex = 92,
    /// Read a constructor field
    EnumField = 93,
    /// Write a constructor field
    SetEnumField = 94,

    // ===== Misc =====
    /// Debug assertion
    Assert = 95,
    /// Raw data pointer of a reference
    RefData = 96,
    /// Reference offset
    RefOffset = 97,
    /// No operation
    Nop = 98,
    /// Memory prefetch hint
    Prefetch = 99,
    /// Inline assembly
    Asm = 100,
}

const ALL: [Opcode; OPCODE_COUNT] = {
    use Opcode::*;
    [
        Mov, Int, Float, Bool, Bytes, String, Null, Add, Sub, Mul, SDiv, UDiv, SMod, UMod, Shl,
        SShr, UShr, And, Or, Xor, Neg, Not, Incr, Decr, Call0, Call1, Call2, Call3, Call4, CallN,
        CallMethod, CallThis, CallClosure, StaticClosure, InstanceClosure, VirtualClosure,
        GetGlobal, SetGlobal, Field, SetField, GetThis, SetThis, DynGet, DynSet, JTrue, JFalse,
        JNull, JNotNull, JSLt, JSGte, JSGt, JSLte, JULt, JUGte, JNotLt, JNotGte, JEq, JNotEq,
        JAlways, ToDyn, ToSFloat, ToUFloat, ToInt, SafeCast, UnsafeCast, ToVirtual, Label, Ret,
        Throw, Rethrow, Switch, NullCheck, Trap, EndTrap, GetI8, GetI16, GetMem, GetArray, SetI8,
        SetI16, SetMem, SetArray, New, ArraySize, Type, GetType, GetTID, Ref, Unref, Setref,
        MakeEnum, EnumAlloc, EnumIndex, EnumField, SetEnumField, Assert, RefData, RefOffset, Nop,
        Prefetch, Asm,
    ]
};

impl Opcode {
    /// Convert a wire tag to an opcode
    ///
    /// Returns None if the tag does not correspond to a valid opcode.
    pub fn from_u8(byte: u8) -> Option<Self> {
        ALL.get(byte as usize).copied()
    }

    /// Convert opcode to its wire tag
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Iterate over every opcode in tag order
    pub fn all() -> impl Iterator<Item = Opcode> {
        ALL.iter().copied()
    }

    /// Raw arity table entry
    #[inline]
    fn arity_entry(self) -> i8 {
        ARITY[self as usize]
    }

    /// Number of fixed arguments, or `None` for `Switch`
    pub fn fixed_args(self) -> Option<usize> {
        match self.arity_entry() {
            SWITCH_ARITY => None,
            n => Some(n.unsigned_abs() as usize),
        }
    }

    /// Whether the opcode carries a counted register list after its fixed
    /// arguments
    pub fn has_variable_args(self) -> bool {
        self.arity_entry() < 0
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::Mov => "Mov",
            Self::Int => "Int",
            Self::Float => "Float",
            Self::Bool => "Bool",
            Self::Bytes => "Bytes",
            Self::String => "String",
            Self::Null => "Null",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::SDiv => "SDiv",
            Self::UDiv => "UDiv",
            Self::SMod => "SMod",
            Self::UMod => "UMod",
            Self::Shl => "Shl",
            Self::SShr => "SShr",
            Self::UShr => "UShr",
            Self::And => "And",
            Self::Or => "Or",
            Self::Xor => "Xor",
            Self::Neg => "Neg",
            Self::Not => "Not",
            Self::Incr => "Incr",
            Self::Decr => "Decr",
            Self::Call0 => "Call0",
            Self::Call1 => "Call1",
            Self::Call2 => "Call2",
            Self::Call3 => "Call3",
            Self::Call4 => "Call4",
            Self::CallN => "CallN",
            Self::CallMethod => "CallMethod",
            Self::CallThis => "CallThis",
            Self::CallClosure => "CallClosure",
            Self::StaticClosure => "StaticClosure",
            Self::InstanceClosure => "InstanceClosure",
            Self::VirtualClosure => "VirtualClosure",
            Self::GetGlobal => "GetGlobal",
            Self::SetGlobal => "SetGlobal",
            Self::Field => "Field",
            Self::SetField => "SetField",
            Self::GetThis => "GetThis",
            Self::SetThis => "SetThis",
            Self::DynGet => "DynGet",
            Self::DynSet => "DynSet",
            Self::JTrue => "JTrue",
            Self::JFalse => "JFalse",
            Self::JNull => "JNull",
            Self::JNotNull => "JNotNull",
            Self::JSLt => "JSLt",
            Self::JSGte => "JSGte",
            Self::JSGt => "JSGt",
            Self::JSLte => "JSLte",
            Self::JULt => "JULt",
            Self::JUGte => "JUGte",
            Self::JNotLt => "JNotLt",
            Self::JNotGte => "JNotGte",
            Self::JEq => "JEq",
            Self::JNotEq => "JNotEq",
            Self::JAlways => "JAlways",
            Self::ToDyn => "ToDyn",
            Self::ToSFloat => "ToSFloat",
            Self::ToUFloat => "ToUFloat",
            Self::ToInt => "ToInt",
            Self::SafeCast => "SafeCast",
            Self::UnsafeCast => "UnsafeCast",
            Self::ToVirtual => "ToVirtual",
            Self::Label => "Label",
            Self::Ret => "Ret",
            Self::Throw => "Throw",
            Self::Rethrow => "Rethrow",
            Self::Switch => "Switch",
            Self::NullCheck => "NullCheck",
            Self::Trap => "Trap",
            Self::EndTrap => "EndTrap",
            Self::GetI8 => "GetI8",
            Self::GetI16 => "GetI16",
            Self::GetMem => "GetMem",
            Self::GetArray => "GetArray",
            Self::SetI8 => "SetI8",
            Self::SetI16 => "SetI16",
            Self::SetMem => "SetMem",
            Self::SetArray => "SetArray",
            Self::New => "New",
            Self::ArraySize => "ArraySize",
            Self::Type => "Type",
            Self::GetType => "GetType",
            Self::GetTID => "GetTID",
            Self::Ref => "Ref",
            Self::Unref => "Unref",
            Self::Setref => "Setref",
            Self::MakeEnum => "MakeEnum",
            Self::EnumAlloc => "EnumAlloc",
            Self::EnumIndex => "EnumIndex",
            Self::EnumField => "EnumField",
            Self::SetEnumField => "SetEnumField",
            Self::Assert => "Assert",
            Self::RefData => "RefData",
            Self::RefOffset => "RefOffset",
            Self::Nop => "Nop",
            Self::Prefetch => "Prefetch",
            Self::Asm => "Asm",
        }
    }

    /// Check if this opcode is a jump instruction
    pub fn is_jump(self) -> bool {
        (Self::JTrue as u8..=Self::JAlways as u8).contains(&(self as u8))
    }

    /// Check if this opcode is a call instruction
    pub fn is_call(self) -> bool {
        (Self::Call0 as u8..=Self::CallClosure as u8).contains(&(self as u8))
    }

    /// Check if this opcode terminates a basic block
    pub fn is_terminator(self) -> bool {
        self.is_jump() || matches!(self, Self::Ret | Self::Throw | Self::Rethrow | Self::Switch)
    }

    /// What the raw argument at `position` refers to
    ///
    /// Positions past the fixed prefix of a variable-arity opcode are
    /// registers; every `Switch` argument after the selector is an offset.
    pub fn operand_kind(self, position: usize) -> OperandKind {
        use OperandKind::*;

        let layout: &[OperandKind] = match self {
            Self::Mov | Self::Neg | Self::Not => &[Reg, Reg],
            Self::Int => &[Reg, Int],
            Self::Float => &[Reg, Float],
            Self::Bool => &[Reg, Inline],
            Self::Bytes => &[Reg, Bytes],
            Self::String => &[Reg, String],
            Self::Null | Self::Incr | Self::Decr => &[Reg],
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::SDiv
            | Self::UDiv
            | Self::SMod
            | Self::UMod
            | Self::Shl
            | Self::SShr
            | Self::UShr
            | Self::And
            | Self::Or
            | Self::Xor => &[Reg, Reg, Reg],
            Self::Call0
            | Self::Call1
            | Self::Call2
            | Self::Call3
            | Self::Call4
            | Self::CallN
            | Self::StaticClosure => &[Reg, Function],
            Self::CallMethod | Self::CallThis => &[Reg, Field],
            Self::CallClosure => &[Reg, Reg],
            Self::InstanceClosure => &[Reg, Function, Reg],
            Self::VirtualClosure | Self::Field => &[Reg, Reg, Field],
            Self::GetGlobal => &[Reg, Global],
            Self::SetGlobal => &[Global, Reg],
            Self::SetField | Self::SetEnumField => &[Reg, Field, Reg],
            Self::GetThis => &[Reg, Field],
            Self::SetThis => &[Field, Reg],
            Self::DynGet => &[Reg, Reg, String],
            Self::DynSet => &[Reg, String, Reg],
            Self::JTrue | Self::JFalse | Self::JNull | Self::JNotNull | Self::Trap => &[Reg, Offset],
            Self::JSLt
            | Self::JSGte
            | Self::JSGt
            | Self::JSLte
            | Self::JULt
            | Self::JUGte
            | Self::JNotLt
            | Self::JNotGte
            | Self::JEq
            | Self::JNotEq => &[Reg, Reg, Offset],
            Self::JAlways => &[Offset],
            Self::Switch => {
                return if position == 0 { Reg } else { Offset };
            }
            Self::Label | Self::Assert | Self::Nop => &[],
            Self::EndTrap => &[Inline],
            Self::Type => &[Reg, Type],
            Self::MakeEnum | Self::EnumAlloc => &[Reg, Construct],
            Self::EnumField => &[Reg, Reg, Construct, Field],
            Self::Prefetch => &[Reg, Field, Inline],
            Self::Asm => &[Inline, Inline, Reg],
            // Registers only
            Self::ToDyn
            | Self::ToSFloat
            | Self::ToUFloat
            | Self::ToInt
            | Self::SafeCast
            | Self::UnsafeCast
            | Self::ToVirtual
            | Self::ArraySize
            | Self::GetType
            | Self::GetTID
            | Self::Ref
            | Self::Unref
            | Self::Setref
            | Self::EnumIndex
            | Self::RefData => &[Reg, Reg],
            Self::Ret | Self::Throw | Self::Rethrow | Self::NullCheck | Self::New => &[Reg],
            Self::GetI8
            | Self::GetI16
            | Self::GetMem
            | Self::GetArray
            | Self::SetI8
            | Self::SetI16
            | Self::SetMem
            | Self::SetArray
            | Self::RefOffset => &[Reg, Reg, Reg],
        };

        layout.get(position).copied().unwrap_or(Reg)
    }
}

/// Meaning of one raw instruction argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Register number
    Reg,
    /// Int pool index
    Int,
    /// Float pool index
    Float,
    /// Byte pool index (string pool before version 5)
    Bytes,
    /// String pool index
    String,
    /// Function index
    Function,
    /// Global slot index
    Global,
    /// Type pool index
    Type,
    /// Field or proto index of the receiver's type
    Field,
    /// Relative branch offset
    Offset,
    /// Enum constructor index
    Construct,
    /// Plain integer
    Inline,
}

/// A raw instruction: opcode plus flat argument list
///
/// For `Switch` the arguments are `[reg, offsets..., default]`. For
/// variable-arity opcodes the counted registers follow the fixed arguments
/// directly; the count itself is not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Opcode tag
    pub opcode: Opcode,
    /// Raw arguments
    pub args: Vec<i32>,
}

impl Instruction {
    /// Create a new instruction
    pub fn new(opcode: Opcode, args: Vec<i32>) -> Self {
        Self { opcode, args }
    }

    /// Encode the instruction
    pub fn encode(&self, writer: &mut BytecodeWriter) -> Result<(), EncodeError> {
        writer.emit_varint(self.opcode.to_u8() as i32)?;

        if self.opcode == Opcode::Switch {
            if self.args.len() < 2 {
                return Err(self.missing_args(2));
            }
            let branches = &self.args[1..self.args.len() - 1];
            writer.emit_varint(self.args[0])?;
            writer.emit_index(branches.len())?;
            for &offset in branches {
                writer.emit_varint(offset)?;
            }
            return writer.emit_varint(self.args[self.args.len() - 1]);
        }

        let fixed = self
            .opcode
            .fixed_args()
            .ok_or(EncodeError::CorruptedArity(self.opcode.to_u8()))?;
        if self.args.len() < fixed || (!self.opcode.has_variable_args() && self.args.len() != fixed) {
            return Err(self.missing_args(fixed));
        }

        for &arg in &self.args[..fixed] {
            writer.emit_varint(arg)?;
        }

        if self.opcode.has_variable_args() {
            let rest = &self.args[fixed..];
            writer.emit_index(rest.len())?;
            for &arg in rest {
                writer.emit_varint(arg)?;
            }
        }

        Ok(())
    }

    /// Decode an instruction
    pub fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        let tag = reader.read_varint()?;
        let opcode = u8::try_from(tag)
            .ok()
            .and_then(Opcode::from_u8)
            .ok_or(DecodeError::InvalidOpcode(tag, offset))?;

        if opcode == Opcode::Switch {
            let selector = reader.read_varint()?;
            let count = reader.read_count()?;
            let mut args = Vec::with_capacity(count + 2);
            args.push(selector);
            for _ in 0..count {
                args.push(reader.read_varint()?);
            }
            args.push(reader.read_varint()?);
            return Ok(Self { opcode, args });
        }

        let fixed = opcode
            .fixed_args()
            .ok_or(DecodeError::CorruptedArity(opcode.to_u8()))?;
        let mut args = Vec::with_capacity(fixed);
        for _ in 0..fixed {
            args.push(reader.read_varint()?);
        }

        if opcode.has_variable_args() {
            let count = reader.read_count()?;
            args.reserve(count);
            for _ in 0..count {
                args.push(reader.read_varint()?);
            }
        }

        Ok(Self { opcode, args })
    }

    fn missing_args(&self, expected: usize) -> EncodeError {
        EncodeError::MissingArguments {
            opcode: self.opcode.name(),
            expected,
            actual: self.args.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(instruction: &Instruction) -> (Vec<u8>, Instruction) {
        let mut writer = BytecodeWriter::new();
        instruction.encode(&mut writer).unwrap();
        let bytes = writer.into_bytes();
        let decoded = Instruction::decode(&mut BytecodeReader::new(&bytes)).unwrap();
        (bytes, decoded)
    }

    #[test]
    fn test_opcode_table_consistency() {
        assert_eq!(Opcode::all().count(), OPCODE_COUNT);
        for (tag, opcode) in Opcode::all().enumerate() {
            assert_eq!(opcode.to_u8() as usize, tag, "tag mismatch for {:?}", opcode);
            assert_eq!(Opcode::from_u8(tag as u8), Some(opcode));
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_u8(101), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(Opcode::Mov.name(), "Mov");
        assert_eq!(Opcode::CallClosure.name(), "CallClosure");
        assert_eq!(Opcode::GetTID.name(), "GetTID");
        assert_eq!(Opcode::Asm.name(), "Asm");
    }

    #[test]
    fn test_arity_lookup() {
        assert_eq!(Opcode::Mov.fixed_args(), Some(2));
        assert_eq!(Opcode::Null.fixed_args(), Some(1));
        assert_eq!(Opcode::Call4.fixed_args(), Some(6));
        assert_eq!(Opcode::Label.fixed_args(), Some(0));
        assert_eq!(Opcode::New.fixed_args(), Some(1));
        assert_eq!(Opcode::EnumField.fixed_args(), Some(4));
        assert_eq!(Opcode::Switch.fixed_args(), None);

        for opcode in [
            Opcode::CallN,
            Opcode::CallMethod,
            Opcode::CallThis,
            Opcode::CallClosure,
            Opcode::MakeEnum,
        ] {
            assert!(opcode.has_variable_args(), "{:?}", opcode);
            assert_eq!(opcode.fixed_args(), Some(2));
        }
        assert!(!Opcode::Call2.has_variable_args());
    }

    #[test]
    fn test_jump_and_call_detection() {
        assert!(Opcode::JTrue.is_jump());
        assert!(Opcode::JAlways.is_jump());
        assert!(!Opcode::ToDyn.is_jump());
        assert!(Opcode::Call0.is_call());
        assert!(Opcode::CallClosure.is_call());
        assert!(!Opcode::StaticClosure.is_call());
        assert!(Opcode::Ret.is_terminator());
        assert!(Opcode::Switch.is_terminator());
        assert!(!Opcode::Mov.is_terminator());
    }

    #[test]
    fn test_operand_layouts_match_arity() {
        for opcode in Opcode::all() {
            let Some(fixed) = opcode.fixed_args() else {
                continue;
            };
            if opcode.has_variable_args() {
                assert_eq!(opcode.operand_kind(fixed), OperandKind::Reg, "{:?}", opcode);
            }
        }

        assert_eq!(Opcode::Int.operand_kind(1), OperandKind::Int);
        assert_eq!(Opcode::CallN.operand_kind(1), OperandKind::Function);
        assert_eq!(Opcode::CallN.operand_kind(5), OperandKind::Reg);
        assert_eq!(Opcode::SetGlobal.operand_kind(0), OperandKind::Global);
        assert_eq!(Opcode::DynSet.operand_kind(1), OperandKind::String);
        assert_eq!(Opcode::JEq.operand_kind(2), OperandKind::Offset);
        assert_eq!(Opcode::Switch.operand_kind(0), OperandKind::Reg);
        assert_eq!(Opcode::Switch.operand_kind(4), OperandKind::Offset);
        assert_eq!(Opcode::Asm.operand_kind(2), OperandKind::Reg);
        assert_eq!(Opcode::EnumField.operand_kind(3), OperandKind::Field);
    }

    #[test]
    fn test_fixed_instruction_encoding() {
        let instruction = Instruction::new(Opcode::Add, vec![0, 1, 2]);
        let (bytes, decoded) = roundtrip(&instruction);
        assert_eq!(bytes, vec![7, 0, 1, 2]);
        assert_eq!(decoded, instruction);
    }

    #[test]
    fn test_variable_instruction_encoding() {
        let instruction = Instruction::new(Opcode::CallN, vec![3, 200, 4, 5, 6, 7, 8]);
        let (bytes, decoded) = roundtrip(&instruction);
        // tag, dst, function (2-byte varint), count, registers
        assert_eq!(bytes, vec![29, 3, 0x80, 200, 5, 4, 5, 6, 7, 8]);
        assert_eq!(decoded, instruction);

        let empty = Instruction::new(Opcode::CallClosure, vec![1, 2]);
        let (bytes, decoded) = roundtrip(&empty);
        assert_eq!(bytes, vec![32, 1, 2, 0]);
        assert_eq!(decoded, empty);
    }

    #[test]
    fn test_switch_encoding() {
        let instruction = Instruction::new(Opcode::Switch, vec![4, 1, 5, -3, 9]);
        let (bytes, decoded) = roundtrip(&instruction);
        assert_eq!(bytes, vec![70, 4, 3, 1, 5, 0xA0, 3, 9]);
        assert_eq!(decoded, instruction);

        let no_branches = Instruction::new(Opcode::Switch, vec![2, 7]);
        assert_eq!(roundtrip(&no_branches).1, no_branches);
    }

    #[test]
    fn test_unknown_tag_fails() {
        let mut writer = BytecodeWriter::new();
        writer.emit_varint(255).unwrap();
        writer.emit_varint(0).unwrap();
        let bytes = writer.into_bytes();

        let result = Instruction::decode(&mut BytecodeReader::new(&bytes));
        assert!(matches!(result, Err(DecodeError::InvalidOpcode(255, 0))));

        let result = Instruction::decode(&mut BytecodeReader::new(&[101]));
        assert!(matches!(result, Err(DecodeError::InvalidOpcode(101, 0))));
    }

    #[test]
    fn test_oversized_argument_count_fails() {
        let call = [29, 3, 4, 0xDF, 0xFF, 0xFF, 0xFF];
        let result = Instruction::decode(&mut BytecodeReader::new(&call));
        assert!(matches!(
            result,
            Err(DecodeError::CountExceedsInput { count: 0x1FFF_FFFF, remaining: 0, offset: 3 })
        ));

        let switch = [70, 4, 0xDF, 0xFF, 0xFF, 0xFF, 1];
        let result = Instruction::decode(&mut BytecodeReader::new(&switch));
        assert!(matches!(result, Err(DecodeError::CountExceedsInput { .. })));
    }

    #[test]
    fn test_missing_arguments_rejected() {
        let mut writer = BytecodeWriter::new();
        let short = Instruction::new(Opcode::Field, vec![0, 1]);
        assert!(matches!(
            short.encode(&mut writer),
            Err(EncodeError::MissingArguments { expected: 3, actual: 2, .. })
        ));

        let long = Instruction::new(Opcode::Ret, vec![0, 1]);
        assert!(long.encode(&mut writer).is_err());

        let switch = Instruction::new(Opcode::Switch, vec![0]);
        assert!(switch.encode(&mut writer).is_err());
    }
}
