//! Resolved instructions
//!
//! [`Op`] has one variant per opcode, except that `Call0`..`Call4` and `CallN`
//! share [`Op::Call`]. Pool-indexed operands hold their values, and type,
//! function and global operands hold arena ids.

use std::fmt;

use super::{FunctionId, GlobalId, GraphError, TypeId};
use crate::opcode::{Instruction, Opcode};

/// Register number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Pool entry an instruction refers to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoolValue<'a> {
    /// Int pool entry
    Int(i32),
    /// Float pool entry
    Float(f64),
    /// String pool entry
    String(&'a str),
    /// Byte pool entry
    Bytes(&'a [u8]),
}

/// Pool lookups while resolving raw operands
pub(crate) trait OperandSource {
    fn int(&self, index: usize) -> Option<i32>;
    fn float(&self, index: usize) -> Option<f64>;
    fn string(&self, index: usize) -> Option<&str>;
    fn bytes(&self, index: usize) -> Option<&[u8]>;
    fn type_count(&self) -> usize;
    fn function_count(&self) -> usize;
    fn global_count(&self) -> usize;
}

/// Final pool indices while flattening resolved operands
pub(crate) trait OperandSink {
    fn int(&self, value: i32) -> Option<usize>;
    fn float(&self, value: f64) -> Option<usize>;
    fn string(&self, value: &str) -> Option<usize>;
    fn bytes(&self, value: &[u8]) -> Option<usize>;
    fn type_index(&self, id: TypeId) -> Option<usize>;
    fn function_index(&self, id: FunctionId) -> Option<usize>;
    fn global_index(&self, id: GlobalId) -> Option<usize>;
}

/// A resolved instruction
///
/// Field names describe the operand: `dst`/`src` registers, `offset` a
/// branch distance relative to the next instruction, `field` and
/// `construct` inline indices into the receiver's type.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ===== Moves & Constants =====
    /// `dst = src`
    Mov {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// `dst = value`
    Int {
        /// Destination register
        dst: Reg,
        /// Int pool value
        value: i32,
    },
    /// `dst = value`
    Float {
        /// Destination register
        dst: Reg,
        /// Float pool value
        value: f64,
    },
    /// `dst = value`
    Bool {
        /// Destination register
        dst: Reg,
        /// Inline flag
        value: bool,
    },
    /// `dst = value`
    Bytes {
        /// Destination register
        dst: Reg,
        /// Byte pool value
        value: Vec<u8>,
    },
    /// `dst = value`
    String {
        /// Destination register
        dst: Reg,
        /// String pool value
        value: String,
    },
    /// `dst = null`
    Null {
        /// Destination register
        dst: Reg,
    },

    // ===== Arithmetic =====
    /// `dst = a + b`
    Add {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// `dst = a - b`
    Sub {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// `dst = a * b`
    Mul {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// Signed `dst = a / b`
    SDiv {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// Unsigned `dst = a / b`
    UDiv {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// Signed `dst = a % b`
    SMod {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// Unsigned `dst = a % b`
    UMod {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// `dst = a << b`
    Shl {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// Arithmetic `dst = a >> b`
    SShr {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// Logical `dst = a >> b`
    UShr {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// `dst = a & b`
    And {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// `dst = a | b`
    Or {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// `dst = a ^ b`
    Xor {
        /// Destination register
        dst: Reg,
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
    },
    /// `dst = -src`
    Neg {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// `dst = !src`
    Not {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// `dst += 1`
    Incr {
        /// Destination register
        dst: Reg,
    },
    /// `dst -= 1`
    Decr {
        /// Destination register
        dst: Reg,
    },

    // ===== Calls =====
    /// `dst = function(args...)`, flattened to `Call0`..`Call4` or `CallN`
    Call {
        /// Destination register
        dst: Reg,
        /// Callee
        function: FunctionId,
        /// Argument registers
        args: Vec<Reg>,
    },
    /// Call proto `field` of `args[0]`
    CallMethod {
        /// Destination register
        dst: Reg,
        /// Proto index
        field: i32,
        /// Argument registers
        args: Vec<Reg>,
    },
    /// Call proto `field` of the receiver
    CallThis {
        /// Destination register
        dst: Reg,
        /// Proto index
        field: i32,
        /// Argument registers
        args: Vec<Reg>,
    },
    /// Call the closure held in `closure`
    CallClosure {
        /// Destination register
        dst: Reg,
        /// Closure register
        closure: Reg,
        /// Argument registers
        args: Vec<Reg>,
    },

    // ===== Closures =====
    /// Closure over a function
    StaticClosure {
        /// Destination register
        dst: Reg,
        /// Target function
        function: FunctionId,
    },
    /// Closure over a function bound to `obj`
    InstanceClosure {
        /// Destination register
        dst: Reg,
        /// Target function
        function: FunctionId,
        /// Object register
        obj: Reg,
    },
    /// Closure over a virtual method of `obj`
    VirtualClosure {
        /// Destination register
        dst: Reg,
        /// Object register
        obj: Reg,
        /// Proto index
        field: i32,
    },

    // ===== Globals & Fields =====
    /// `dst = global`
    GetGlobal {
        /// Destination register
        dst: Reg,
        /// Global slot
        global: GlobalId,
    },
    /// `global = src`
    SetGlobal {
        /// Global slot
        global: GlobalId,
        /// Source register
        src: Reg,
    },
    /// `dst = obj.field`
    Field {
        /// Destination register
        dst: Reg,
        /// Object register
        obj: Reg,
        /// Field index in the receiver's type
        field: i32,
    },
    /// `obj.field = src`
    SetField {
        /// Object register
        obj: Reg,
        /// Field index in the receiver's type
        field: i32,
        /// Source register
        src: Reg,
    },
    /// `dst = this.field`
    GetThis {
        /// Destination register
        dst: Reg,
        /// Field index in the receiver's type
        field: i32,
    },
    /// `this.field = src`
    SetThis {
        /// Field index in the receiver's type
        field: i32,
        /// Source register
        src: Reg,
    },
    /// `dst = obj[name]`
    DynGet {
        /// Destination register
        dst: Reg,
        /// Object register
        obj: Reg,
        /// Dynamic field name
        name: String,
    },
    /// `obj[name] = src`
    DynSet {
        /// Object register
        obj: Reg,
        /// Dynamic field name
        name: String,
        /// Source register
        src: Reg,
    },

    // ===== Jumps =====
    /// Branch if `reg` is true
    JTrue {
        /// Operand register
        reg: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `reg` is false
    JFalse {
        /// Operand register
        reg: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `reg` is null
    JNull {
        /// Operand register
        reg: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch unless `reg` is null
    JNotNull {
        /// Operand register
        reg: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `a < b` (signed)
    JSLt {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `a >= b` (signed)
    JSGte {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `a > b` (signed)
    JSGt {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `a <= b` (signed)
    JSLte {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `a < b` (unsigned)
    JULt {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `a >= b` (unsigned)
    JUGte {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch unless `a < b`
    JNotLt {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch unless `a >= b`
    JNotGte {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `a == b`
    JEq {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Branch if `a != b`
    JNotEq {
        /// Left operand
        a: Reg,
        /// Right operand
        b: Reg,
        /// Branch offset from the next instruction
        offset: i32,
    },
    /// Unconditional branch
    JAlways {
        /// Branch offset from the next instruction
        offset: i32,
    },

    // ===== Conversions =====
    /// Box `src` as a dynamic value
    ToDyn {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// Signed integer to float
    ToSFloat {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// Unsigned integer to float
    ToUFloat {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// Float to integer
    ToInt {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// Checked cast
    SafeCast {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// Unchecked cast
    UnsafeCast {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// Convert to a virtual
    ToVirtual {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },

    // ===== Control Flow =====
    /// Backward branch target
    Label,
    /// Return `reg`
    Ret {
        /// Returned register
        reg: Reg,
    },
    /// Throw the exception in `reg`
    Throw {
        /// Operand register
        reg: Reg,
    },
    /// Rethrow the exception in `reg`
    Rethrow {
        /// Operand register
        reg: Reg,
    },
    /// Multi-way branch on `reg`
    Switch {
        /// Selector register
        reg: Reg,
        /// Branch offsets, one per case
        offsets: Vec<i32>,
        /// Offset taken when the selector is out of range
        default: i32,
    },
    /// Throw if `reg` is null
    NullCheck {
        /// Operand register
        reg: Reg,
    },
    /// Install a handler storing the exception in `reg`
    Trap {
        /// Register receiving the exception
        reg: Reg,
        /// Offset of the handler
        offset: i32,
    },
    /// Remove the innermost handler
    EndTrap {
        /// Inline operand
        inline: i32,
    },

    // ===== Memory =====
    /// `dst = bytes[index]` as 8 bits
    GetI8 {
        /// Destination register
        dst: Reg,
        /// Byte buffer register
        bytes: Reg,
        /// Index register
        index: Reg,
    },
    /// `dst = bytes[index]` as 16 bits
    GetI16 {
        /// Destination register
        dst: Reg,
        /// Byte buffer register
        bytes: Reg,
        /// Index register
        index: Reg,
    },
    /// `dst = bytes[index]` at the width of `dst`
    GetMem {
        /// Destination register
        dst: Reg,
        /// Byte buffer register
        bytes: Reg,
        /// Index register
        index: Reg,
    },
    /// `dst = array[index]`
    GetArray {
        /// Destination register
        dst: Reg,
        /// Array register
        array: Reg,
        /// Index register
        index: Reg,
    },
    /// `bytes[index] = src` as 8 bits
    SetI8 {
        /// Byte buffer register
        bytes: Reg,
        /// Index register
        index: Reg,
        /// Source register
        src: Reg,
    },
    /// `bytes[index] = src` as 16 bits
    SetI16 {
        /// Byte buffer register
        bytes: Reg,
        /// Index register
        index: Reg,
        /// Source register
        src: Reg,
    },
    /// `bytes[index] = src` at the width of `src`
    SetMem {
        /// Byte buffer register
        bytes: Reg,
        /// Index register
        index: Reg,
        /// Source register
        src: Reg,
    },
    /// `array[index] = src`
    SetArray {
        /// Array register
        array: Reg,
        /// Index register
        index: Reg,
        /// Source register
        src: Reg,
    },

    // ===== Objects & Types =====
    /// Allocate an instance of the type of `dst`
    New {
        /// Destination register
        dst: Reg,
    },
    /// `dst = array.length`
    ArraySize {
        /// Destination register
        dst: Reg,
        /// Array register
        array: Reg,
    },
    /// `dst = ty`
    Type {
        /// Destination register
        dst: Reg,
        /// Type operand
        ty: TypeId,
    },
    /// `dst = typeof src`
    GetType {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// Kind tag of the type of `src`
    GetTID {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// `dst = &src`
    Ref {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// `dst = *src`
    Unref {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// `*dst = src`
    Setref {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },

    // ===== Enums =====
    /// Construct an enum value from `args`
    MakeEnum {
        /// Destination register
        dst: Reg,
        /// Enum constructor index
        construct: i32,
        /// Argument registers
        args: Vec<Reg>,
    },
    /// Allocate an enum value with default fields
    EnumAlloc {
        /// Destination register
        dst: Reg,
        /// Enum constructor index
        construct: i32,
    },
    /// Constructor index of `value`
    EnumIndex {
        /// Destination register
        dst: Reg,
        /// Enum value register
        value: Reg,
    },
    /// Read a constructor field of `value`
    EnumField {
        /// Destination register
        dst: Reg,
        /// Enum value register
        value: Reg,
        /// Enum constructor index
        construct: i32,
        /// Parameter index within the constructor
        field: i32,
    },
    /// Write a constructor field of `value`
    SetEnumField {
        /// Enum value register
        value: Reg,
        /// Parameter index
        field: i32,
        /// Source register
        src: Reg,
    },

    // ===== Misc =====
    /// Debug assertion
    Assert,
    /// Data pointer of the array or bytes in `src`
    RefData {
        /// Destination register
        dst: Reg,
        /// Source register
        src: Reg,
    },
    /// `dst = reference + offset`
    RefOffset {
        /// Destination register
        dst: Reg,
        /// Reference register
        reference: Reg,
        /// Offset register
        offset: Reg,
    },
    /// No operation
    Nop,
    /// Memory prefetch hint
    Prefetch {
        /// Operand register
        reg: Reg,
        /// Field index
        field: i32,
        /// Mode operand
        mode: i32,
    },
    /// Inline assembly
    Asm {
        /// Mode operand
        mode: i32,
        /// Inline payload
        value: i32,
        /// Operand register
        reg: Reg,
    },
}

impl Op {
    /// Resolve a raw instruction against the module pools
    pub(crate) fn resolve<S>(instruction: &Instruction, source: &S) -> Result<Self, GraphError>
    where
        S: OperandSource + ?Sized,
    {
        let mut a = Operands {
            instruction,
            position: 0,
            source,
        };

        let op = match instruction.opcode {
            Opcode::Call0
            | Opcode::Call1
            | Opcode::Call2
            | Opcode::Call3
            | Opcode::Call4
            | Opcode::CallN => Op::Call {
                dst: a.reg()?,
                function: a.function()?,
                args: a.regs()?,
            },
            Opcode::Switch => {
                let reg = a.reg()?;
                let mut offsets = a.rest();
                let default = offsets.pop().ok_or(GraphError::MissingOperand {
                    opcode: instruction.opcode.name(),
                    position: 1,
                })?;
                Op::Switch {
                    reg,
                    offsets,
                    default,
                }
            }
            Opcode::Mov => Op::Mov {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::Int => Op::Int {
                dst: a.reg()?,
                value: a.int()?,
            },
            Opcode::Float => Op::Float {
                dst: a.reg()?,
                value: a.float()?,
            },
            Opcode::Bool => Op::Bool {
                dst: a.reg()?,
                value: a.inline()? != 0,
            },
            Opcode::Bytes => Op::Bytes {
                dst: a.reg()?,
                value: a.bytes()?,
            },
            Opcode::String => Op::String {
                dst: a.reg()?,
                value: a.string()?,
            },
            Opcode::Null => Op::Null {
                dst: a.reg()?,
            },
            Opcode::Add => Op::Add {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::Sub => Op::Sub {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::Mul => Op::Mul {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::SDiv => Op::SDiv {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::UDiv => Op::UDiv {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::SMod => Op::SMod {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::UMod => Op::UMod {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::Shl => Op::Shl {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::SShr => Op::SShr {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::UShr => Op::UShr {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::And => Op::And {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::Or => Op::Or {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::Xor => Op::Xor {
                dst: a.reg()?,
                a: a.reg()?,
                b: a.reg()?,
            },
            Opcode::Neg => Op::Neg {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::Not => Op::Not {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::Incr => Op::Incr {
                dst: a.reg()?,
            },
            Opcode::Decr => Op::Decr {
                dst: a.reg()?,
            },
            Opcode::CallMethod => Op::CallMethod {
                dst: a.reg()?,
                field: a.inline()?,
                args: a.regs()?,
            },
            Opcode::CallThis => Op::CallThis {
                dst: a.reg()?,
                field: a.inline()?,
                args: a.regs()?,
            },
            Opcode::CallClosure => Op::CallClosure {
                dst: a.reg()?,
                closure: a.reg()?,
                args: a.regs()?,
            },
            Opcode::StaticClosure => Op::StaticClosure {
                dst: a.reg()?,
                function: a.function()?,
            },
            Opcode::InstanceClosure => Op::InstanceClosure {
                dst: a.reg()?,
                function: a.function()?,
                obj: a.reg()?,
            },
            Opcode::VirtualClosure => Op::VirtualClosure {
                dst: a.reg()?,
                obj: a.reg()?,
                field: a.inline()?,
            },
            Opcode::GetGlobal => Op::GetGlobal {
                dst: a.reg()?,
                global: a.global()?,
            },
            Opcode::SetGlobal => Op::SetGlobal {
                global: a.global()?,
                src: a.reg()?,
            },
            Opcode::Field => Op::Field {
                dst: a.reg()?,
                obj: a.reg()?,
                field: a.inline()?,
            },
            Opcode::SetField => Op::SetField {
                obj: a.reg()?,
                field: a.inline()?,
                src: a.reg()?,
            },
            Opcode::GetThis => Op::GetThis {
                dst: a.reg()?,
                field: a.inline()?,
            },
            Opcode::SetThis => Op::SetThis {
                field: a.inline()?,
                src: a.reg()?,
            },
            Opcode::DynGet => Op::DynGet {
                dst: a.reg()?,
                obj: a.reg()?,
                name: a.string()?,
            },
            Opcode::DynSet => Op::DynSet {
                obj: a.reg()?,
                name: a.string()?,
                src: a.reg()?,
            },
            Opcode::JTrue => Op::JTrue {
                reg: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JFalse => Op::JFalse {
                reg: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JNull => Op::JNull {
                reg: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JNotNull => Op::JNotNull {
                reg: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JSLt => Op::JSLt {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JSGte => Op::JSGte {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JSGt => Op::JSGt {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JSLte => Op::JSLte {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JULt => Op::JULt {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JUGte => Op::JUGte {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JNotLt => Op::JNotLt {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JNotGte => Op::JNotGte {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JEq => Op::JEq {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JNotEq => Op::JNotEq {
                a: a.reg()?,
                b: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::JAlways => Op::JAlways {
                offset: a.inline()?,
            },
            Opcode::ToDyn => Op::ToDyn {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::ToSFloat => Op::ToSFloat {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::ToUFloat => Op::ToUFloat {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::ToInt => Op::ToInt {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::SafeCast => Op::SafeCast {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::UnsafeCast => Op::UnsafeCast {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::ToVirtual => Op::ToVirtual {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::Label => Op::Label,
            Opcode::Ret => Op::Ret {
                reg: a.reg()?,
            },
            Opcode::Throw => Op::Throw {
                reg: a.reg()?,
            },
            Opcode::Rethrow => Op::Rethrow {
                reg: a.reg()?,
            },
            Opcode::NullCheck => Op::NullCheck {
                reg: a.reg()?,
            },
            Opcode::Trap => Op::Trap {
                reg: a.reg()?,
                offset: a.inline()?,
            },
            Opcode::EndTrap => Op::EndTrap {
                inline: a.inline()?,
            },
            Opcode::GetI8 => Op::GetI8 {
                dst: a.reg()?,
                bytes: a.reg()?,
                index: a.reg()?,
            },
            Opcode::GetI16 => Op::GetI16 {
                dst: a.reg()?,
                bytes: a.reg()?,
                index: a.reg()?,
            },
            Opcode::GetMem => Op::GetMem {
                dst: a.reg()?,
                bytes: a.reg()?,
                index: a.reg()?,
            },
            Opcode::GetArray => Op::GetArray {
                dst: a.reg()?,
                array: a.reg()?,
                index: a.reg()?,
            },
            Opcode::SetI8 => Op::SetI8 {
                bytes: a.reg()?,
                index: a.reg()?,
                src: a.reg()?,
            },
            Opcode::SetI16 => Op::SetI16 {
                bytes: a.reg()?,
                index: a.reg()?,
                src: a.reg()?,
            },
            Opcode::SetMem => Op::SetMem {
                bytes: a.reg()?,
                index: a.reg()?,
                src: a.reg()?,
            },
            Opcode::SetArray => Op::SetArray {
                array: a.reg()?,
                index: a.reg()?,
                src: a.reg()?,
            },
            Opcode::New => Op::New {
                dst: a.reg()?,
            },
            Opcode::ArraySize => Op::ArraySize {
                dst: a.reg()?,
                array: a.reg()?,
            },
            Opcode::Type => Op::Type {
                dst: a.reg()?,
                ty: a.ty()?,
            },
            Opcode::GetType => Op::GetType {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::GetTID => Op::GetTID {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::Ref => Op::Ref {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::Unref => Op::Unref {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::Setref => Op::Setref {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::MakeEnum => Op::MakeEnum {
                dst: a.reg()?,
                construct: a.inline()?,
                args: a.regs()?,
            },
            Opcode::EnumAlloc => Op::EnumAlloc {
                dst: a.reg()?,
                construct: a.inline()?,
            },
            Opcode::EnumIndex => Op::EnumIndex {
                dst: a.reg()?,
                value: a.reg()?,
            },
            Opcode::EnumField => Op::EnumField {
                dst: a.reg()?,
                value: a.reg()?,
                construct: a.inline()?,
                field: a.inline()?,
            },
            Opcode::SetEnumField => Op::SetEnumField {
                value: a.reg()?,
                field: a.inline()?,
                src: a.reg()?,
            },
            Opcode::Assert => Op::Assert,
            Opcode::RefData => Op::RefData {
                dst: a.reg()?,
                src: a.reg()?,
            },
            Opcode::RefOffset => Op::RefOffset {
                dst: a.reg()?,
                reference: a.reg()?,
                offset: a.reg()?,
            },
            Opcode::Nop => Op::Nop,
            Opcode::Prefetch => Op::Prefetch {
                reg: a.reg()?,
                field: a.inline()?,
                mode: a.inline()?,
            },
            Opcode::Asm => Op::Asm {
                mode: a.inline()?,
                value: a.inline()?,
                reg: a.reg()?,
            },
        };

        a.finish()?;
        Ok(op)
    }

    /// Flatten back to a raw instruction using final pool indices
    pub(crate) fn flatten<S>(&self, sink: &S) -> Result<Instruction, GraphError>
    where
        S: OperandSink + ?Sized,
    {
        let mut e = Emitter {
            args: Vec::new(),
            sink,
        };

        match self {
            Op::Call {
                dst,
                function,
                args,
            } => {
                e.reg(*dst)?;
                e.function(*function)?;
                e.regs(args)?;
            }
            Op::Switch {
                reg,
                offsets,
                default,
            } => {
                e.reg(*reg)?;
                e.args.extend_from_slice(offsets);
                e.inline(*default);
            }
            Op::Mov { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::Int { dst, value } => {
                e.reg(*dst)?;
                e.int(*value)?;
            }
            Op::Float { dst, value } => {
                e.reg(*dst)?;
                e.float(*value)?;
            }
            Op::Bool { dst, value } => {
                e.reg(*dst)?;
                e.inline(*value as i32);
            }
            Op::Bytes { dst, value } => {
                e.reg(*dst)?;
                e.bytes(value)?;
            }
            Op::String { dst, value } => {
                e.reg(*dst)?;
                e.string(value)?;
            }
            Op::Null { dst } => {
                e.reg(*dst)?;
            }
            Op::Add { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::Sub { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::Mul { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::SDiv { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::UDiv { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::SMod { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::UMod { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::Shl { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::SShr { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::UShr { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::And { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::Or { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::Xor { dst, a, b } => {
                e.reg(*dst)?;
                e.reg(*a)?;
                e.reg(*b)?;
            }
            Op::Neg { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::Not { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::Incr { dst } => {
                e.reg(*dst)?;
            }
            Op::Decr { dst } => {
                e.reg(*dst)?;
            }
            Op::CallMethod { dst, field, args } => {
                e.reg(*dst)?;
                e.inline(*field);
                e.regs(args)?;
            }
            Op::CallThis { dst, field, args } => {
                e.reg(*dst)?;
                e.inline(*field);
                e.regs(args)?;
            }
            Op::CallClosure { dst, closure, args } => {
                e.reg(*dst)?;
                e.reg(*closure)?;
                e.regs(args)?;
            }
            Op::StaticClosure { dst, function } => {
                e.reg(*dst)?;
                e.function(*function)?;
            }
            Op::InstanceClosure { dst, function, obj } => {
                e.reg(*dst)?;
                e.function(*function)?;
                e.reg(*obj)?;
            }
            Op::VirtualClosure { dst, obj, field } => {
                e.reg(*dst)?;
                e.reg(*obj)?;
                e.inline(*field);
            }
            Op::GetGlobal { dst, global } => {
                e.reg(*dst)?;
                e.global(*global)?;
            }
            Op::SetGlobal { global, src } => {
                e.global(*global)?;
                e.reg(*src)?;
            }
            Op::Field { dst, obj, field } => {
                e.reg(*dst)?;
                e.reg(*obj)?;
                e.inline(*field);
            }
            Op::SetField { obj, field, src } => {
                e.reg(*obj)?;
                e.inline(*field);
                e.reg(*src)?;
            }
            Op::GetThis { dst, field } => {
                e.reg(*dst)?;
                e.inline(*field);
            }
            Op::SetThis { field, src } => {
                e.inline(*field);
                e.reg(*src)?;
            }
            Op::DynGet { dst, obj, name } => {
                e.reg(*dst)?;
                e.reg(*obj)?;
                e.string(name)?;
            }
            Op::DynSet { obj, name, src } => {
                e.reg(*obj)?;
                e.string(name)?;
                e.reg(*src)?;
            }
            Op::JTrue { reg, offset } => {
                e.reg(*reg)?;
                e.inline(*offset);
            }
            Op::JFalse { reg, offset } => {
                e.reg(*reg)?;
                e.inline(*offset);
            }
            Op::JNull { reg, offset } => {
                e.reg(*reg)?;
                e.inline(*offset);
            }
            Op::JNotNull { reg, offset } => {
                e.reg(*reg)?;
                e.inline(*offset);
            }
            Op::JSLt { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JSGte { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JSGt { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JSLte { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JULt { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JUGte { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JNotLt { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JNotGte { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JEq { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JNotEq { a, b, offset } => {
                e.reg(*a)?;
                e.reg(*b)?;
                e.inline(*offset);
            }
            Op::JAlways { offset } => {
                e.inline(*offset);
            }
            Op::ToDyn { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::ToSFloat { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::ToUFloat { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::ToInt { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::SafeCast { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::UnsafeCast { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::ToVirtual { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::Label => {}
            Op::Ret { reg } => {
                e.reg(*reg)?;
            }
            Op::Throw { reg } => {
                e.reg(*reg)?;
            }
            Op::Rethrow { reg } => {
                e.reg(*reg)?;
            }
            Op::NullCheck { reg } => {
                e.reg(*reg)?;
            }
            Op::Trap { reg, offset } => {
                e.reg(*reg)?;
                e.inline(*offset);
            }
            Op::EndTrap { inline } => {
                e.inline(*inline);
            }
            Op::GetI8 { dst, bytes, index } => {
                e.reg(*dst)?;
                e.reg(*bytes)?;
                e.reg(*index)?;
            }
            Op::GetI16 { dst, bytes, index } => {
                e.reg(*dst)?;
                e.reg(*bytes)?;
                e.reg(*index)?;
            }
            Op::GetMem { dst, bytes, index } => {
                e.reg(*dst)?;
                e.reg(*bytes)?;
                e.reg(*index)?;
            }
            Op::GetArray { dst, array, index } => {
                e.reg(*dst)?;
                e.reg(*array)?;
                e.reg(*index)?;
            }
            Op::SetI8 { bytes, index, src } => {
                e.reg(*bytes)?;
                e.reg(*index)?;
                e.reg(*src)?;
            }
            Op::SetI16 { bytes, index, src } => {
                e.reg(*bytes)?;
                e.reg(*index)?;
                e.reg(*src)?;
            }
            Op::SetMem { bytes, index, src } => {
                e.reg(*bytes)?;
                e.reg(*index)?;
                e.reg(*src)?;
            }
            Op::SetArray { array, index, src } => {
                e.reg(*array)?;
                e.reg(*index)?;
                e.reg(*src)?;
            }
            Op::New { dst } => {
                e.reg(*dst)?;
            }
            Op::ArraySize { dst, array } => {
                e.reg(*dst)?;
                e.reg(*array)?;
            }
            Op::Type { dst, ty } => {
                e.reg(*dst)?;
                e.ty(*ty)?;
            }
            Op::GetType { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::GetTID { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::Ref { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::Unref { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::Setref { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::MakeEnum { dst, construct, args } => {
                e.reg(*dst)?;
                e.inline(*construct);
                e.regs(args)?;
            }
            Op::EnumAlloc { dst, construct } => {
                e.reg(*dst)?;
                e.inline(*construct);
            }
            Op::EnumIndex { dst, value } => {
                e.reg(*dst)?;
                e.reg(*value)?;
            }
            Op::EnumField { dst, value, construct, field } => {
                e.reg(*dst)?;
                e.reg(*value)?;
                e.inline(*construct);
                e.inline(*field);
            }
            Op::SetEnumField { value, field, src } => {
                e.reg(*value)?;
                e.inline(*field);
                e.reg(*src)?;
            }
            Op::Assert => {}
            Op::RefData { dst, src } => {
                e.reg(*dst)?;
                e.reg(*src)?;
            }
            Op::RefOffset { dst, reference, offset } => {
                e.reg(*dst)?;
                e.reg(*reference)?;
                e.reg(*offset)?;
            }
            Op::Nop => {}
            Op::Prefetch { reg, field, mode } => {
                e.reg(*reg)?;
                e.inline(*field);
                e.inline(*mode);
            }
            Op::Asm { mode, value, reg } => {
                e.inline(*mode);
                e.inline(*value);
                e.reg(*reg)?;
            }
        }

        Ok(Instruction::new(self.opcode(), e.args))
    }

    /// Opcode this instruction flattens to
    pub fn opcode(&self) -> Opcode {
        match self {
            Op::Call { args, .. } => match args.len() {
                0 => Opcode::Call0,
                1 => Opcode::Call1,
                2 => Opcode::Call2,
                3 => Opcode::Call3,
                4 => Opcode::Call4,
                _ => Opcode::CallN,
            },
            Op::Switch { .. } => Opcode::Switch,
            Op::Mov { .. } => Opcode::Mov,
            Op::Int { .. } => Opcode::Int,
            Op::Float { .. } => Opcode::Float,
            Op::Bool { .. } => Opcode::Bool,
            Op::Bytes { .. } => Opcode::Bytes,
            Op::String { .. } => Opcode::String,
            Op::Null { .. } => Opcode::Null,
            Op::Add { .. } => Opcode::Add,
            Op::Sub { .. } => Opcode::Sub,
            Op::Mul { .. } => Opcode::Mul,
            Op::SDiv { .. } => Opcode::SDiv,
            Op::UDiv { .. } => Opcode::UDiv,
            Op::SMod { .. } => Opcode::SMod,
            Op::UMod { .. } => Opcode::UMod,
            Op::Shl { .. } => Opcode::Shl,
            Op::SShr { .. } => Opcode::SShr,
            Op::UShr { .. } => Opcode::UShr,
            Op::And { .. } => Opcode::And,
            Op::Or { .. } => Opcode::Or,
            Op::Xor { .. } => Opcode::Xor,
            Op::Neg { .. } => Opcode::Neg,
            Op::Not { .. } => Opcode::Not,
            Op::Incr { .. } => Opcode::Incr,
            Op::Decr { .. } => Opcode::Decr,
            Op::CallMethod { .. } => Opcode::CallMethod,
            Op::CallThis { .. } => Opcode::CallThis,
            Op::CallClosure { .. } => Opcode::CallClosure,
            Op::StaticClosure { .. } => Opcode::StaticClosure,
            Op::InstanceClosure { .. } => Opcode::InstanceClosure,
            Op::VirtualClosure { .. } => Opcode::VirtualClosure,
            Op::GetGlobal { .. } => Opcode::GetGlobal,
            Op::SetGlobal { .. } => Opcode::SetGlobal,
            Op::Field { .. } => Opcode::Field,
            Op::SetField { .. } => Opcode::SetField,
            Op::GetThis { .. } => Opcode::GetThis,
            Op::SetThis { .. } => Opcode::SetThis,
            Op::DynGet { .. } => Opcode::DynGet,
            Op::DynSet { .. } => Opcode::DynSet,
            Op::JTrue { .. } => Opcode::JTrue,
            Op::JFalse { .. } => Opcode::JFalse,
            Op::JNull { .. } => Opcode::JNull,
            Op::JNotNull { .. } => Opcode::JNotNull,
            Op::JSLt { .. } => Opcode::JSLt,
            Op::JSGte { .. } => Opcode::JSGte,
            Op::JSGt { .. } => Opcode::JSGt,
            Op::JSLte { .. } => Opcode::JSLte,
            Op::JULt { .. } => Opcode::JULt,
            Op::JUGte { .. } => Opcode::JUGte,
            Op::JNotLt { .. } => Opcode::JNotLt,
            Op::JNotGte { .. } => Opcode::JNotGte,
            Op::JEq { .. } => Opcode::JEq,
            Op::JNotEq { .. } => Opcode::JNotEq,
            Op::JAlways { .. } => Opcode::JAlways,
            Op::ToDyn { .. } => Opcode::ToDyn,
            Op::ToSFloat { .. } => Opcode::ToSFloat,
            Op::ToUFloat { .. } => Opcode::ToUFloat,
            Op::ToInt { .. } => Opcode::ToInt,
            Op::SafeCast { .. } => Opcode::SafeCast,
            Op::UnsafeCast { .. } => Opcode::UnsafeCast,
            Op::ToVirtual { .. } => Opcode::ToVirtual,
            Op::Label => Opcode::Label,
            Op::Ret { .. } => Opcode::Ret,
            Op::Throw { .. } => Opcode::Throw,
            Op::Rethrow { .. } => Opcode::Rethrow,
            Op::NullCheck { .. } => Opcode::NullCheck,
            Op::Trap { .. } => Opcode::Trap,
            Op::EndTrap { .. } => Opcode::EndTrap,
            Op::GetI8 { .. } => Opcode::GetI8,
            Op::GetI16 { .. } => Opcode::GetI16,
            Op::GetMem { .. } => Opcode::GetMem,
            Op::GetArray { .. } => Opcode::GetArray,
            Op::SetI8 { .. } => Opcode::SetI8,
            Op::SetI16 { .. } => Opcode::SetI16,
            Op::SetMem { .. } => Opcode::SetMem,
            Op::SetArray { .. } => Opcode::SetArray,
            Op::New { .. } => Opcode::New,
            Op::ArraySize { .. } => Opcode::ArraySize,
            Op::Type { .. } => Opcode::Type,
            Op::GetType { .. } => Opcode::GetType,
            Op::GetTID { .. } => Opcode::GetTID,
            Op::Ref { .. } => Opcode::Ref,
            Op::Unref { .. } => Opcode::Unref,
            Op::Setref { .. } => Opcode::Setref,
            Op::MakeEnum { .. } => Opcode::MakeEnum,
            Op::EnumAlloc { .. } => Opcode::EnumAlloc,
            Op::EnumIndex { .. } => Opcode::EnumIndex,
            Op::EnumField { .. } => Opcode::EnumField,
            Op::SetEnumField { .. } => Opcode::SetEnumField,
            Op::Assert => Opcode::Assert,
            Op::RefData { .. } => Opcode::RefData,
            Op::RefOffset { .. } => Opcode::RefOffset,
            Op::Nop => Opcode::Nop,
            Op::Prefetch { .. } => Opcode::Prefetch,
            Op::Asm { .. } => Opcode::Asm,
        }
    }

    /// The int, float, string or byte pool entry this instruction uses
    pub fn pool_value(&self) -> Option<PoolValue<'_>> {
        match self {
            Op::Int { value, .. } => Some(PoolValue::Int(*value)),
            Op::Float { value, .. } => Some(PoolValue::Float(*value)),
            Op::String { value, .. } => Some(PoolValue::String(value)),
            Op::Bytes { value, .. } => Some(PoolValue::Bytes(value)),
            Op::DynGet { name, .. } | Op::DynSet { name, .. } => Some(PoolValue::String(name)),
            _ => None,
        }
    }

    /// Function this instruction refers to, if any
    pub fn function(&self) -> Option<FunctionId> {
        match self {
            Op::Call { function, .. }
            | Op::StaticClosure { function, .. }
            | Op::InstanceClosure { function, .. } => Some(*function),
            _ => None,
        }
    }
}

struct Operands<'a, S: ?Sized> {
    instruction: &'a Instruction,
    position: usize,
    source: &'a S,
}

impl<S: OperandSource + ?Sized> Operands<'_, S> {
    fn next(&mut self) -> Result<i32, GraphError> {
        let value = self
            .instruction
            .args
            .get(self.position)
            .copied()
            .ok_or(GraphError::MissingOperand {
                opcode: self.instruction.opcode.name(),
                position: self.position,
            })?;
        self.position += 1;
        Ok(value)
    }

    fn rest(&mut self) -> Vec<i32> {
        let rest = self.instruction.args[self.position.min(self.instruction.args.len())..].to_vec();
        self.position = self.instruction.args.len();
        rest
    }

    fn finish(self) -> Result<(), GraphError> {
        if self.position == self.instruction.args.len() {
            Ok(())
        } else {
            Err(GraphError::TrailingOperands {
                opcode: self.instruction.opcode.name(),
                expected: self.position,
                actual: self.instruction.args.len(),
            })
        }
    }

    fn index(&mut self, pool: &'static str, len: usize) -> Result<usize, GraphError> {
        let raw = self.next()?;
        match usize::try_from(raw) {
            Ok(index) if index < len => Ok(index),
            _ => Err(GraphError::Missing {
                pool,
                index: raw as i64,
            }),
        }
    }

    fn lookup<T>(&mut self, pool: &'static str, get: impl Fn(&S, usize) -> Option<T>) -> Result<T, GraphError> {
        let raw = self.next()?;
        usize::try_from(raw)
            .ok()
            .and_then(|index| get(self.source, index))
            .ok_or(GraphError::Missing {
                pool,
                index: raw as i64,
            })
    }

    fn reg(&mut self) -> Result<Reg, GraphError> {
        let raw = self.next()?;
        u32::try_from(raw).map(Reg).map_err(|_| GraphError::InvalidOperand {
            opcode: self.instruction.opcode.name(),
            position: self.position - 1,
            value: raw,
        })
    }

    fn regs(&mut self) -> Result<Vec<Reg>, GraphError> {
        let mut regs = Vec::with_capacity(self.instruction.args.len().saturating_sub(self.position));
        while self.position < self.instruction.args.len() {
            regs.push(self.reg()?);
        }
        Ok(regs)
    }

    fn inline(&mut self) -> Result<i32, GraphError> {
        self.next()
    }

    fn int(&mut self) -> Result<i32, GraphError> {
        self.lookup("int", |s, i| s.int(i))
    }

    fn float(&mut self) -> Result<f64, GraphError> {
        self.lookup("float", |s, i| s.float(i))
    }

    fn string(&mut self) -> Result<String, GraphError> {
        self.lookup("string", |s, i| s.string(i).map(str::to_owned))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, GraphError> {
        self.lookup("bytes", |s, i| s.bytes(i).map(<[u8]>::to_vec))
    }

    fn ty(&mut self) -> Result<TypeId, GraphError> {
        let len = self.source.type_count();
        self.index("type", len).map(TypeId)
    }

    fn function(&mut self) -> Result<FunctionId, GraphError> {
        let len = self.source.function_count();
        self.index("function", len).map(FunctionId)
    }

    fn global(&mut self) -> Result<GlobalId, GraphError> {
        let len = self.source.global_count();
        self.index("global", len).map(GlobalId)
    }
}

struct Emitter<'a, S: ?Sized> {
    args: Vec<i32>,
    sink: &'a S,
}

impl<S: OperandSink + ?Sized> Emitter<'_, S> {
    fn push_index(&mut self, pool: &'static str, index: Option<usize>, value: impl fmt::Debug) -> Result<(), GraphError> {
        let index = index
            .and_then(|i| i32::try_from(i).ok())
            .ok_or_else(|| GraphError::DanglingReference {
                pool,
                value: format!("{:?}", value),
            })?;
        self.args.push(index);
        Ok(())
    }

    fn reg(&mut self, reg: Reg) -> Result<(), GraphError> {
        let raw = i32::try_from(reg.0).map_err(|_| GraphError::DanglingReference {
            pool: "register",
            value: reg.to_string(),
        })?;
        self.args.push(raw);
        Ok(())
    }

    fn regs(&mut self, regs: &[Reg]) -> Result<(), GraphError> {
        for &reg in regs {
            self.reg(reg)?;
        }
        Ok(())
    }

    fn inline(&mut self, value: i32) {
        self.args.push(value);
    }

    fn int(&mut self, value: i32) -> Result<(), GraphError> {
        let index = self.sink.int(value);
        self.push_index("int", index, value)
    }

    fn float(&mut self, value: f64) -> Result<(), GraphError> {
        let index = self.sink.float(value);
        self.push_index("float", index, value)
    }

    fn string(&mut self, value: &str) -> Result<(), GraphError> {
        let index = self.sink.string(value);
        self.push_index("string", index, value)
    }

    fn bytes(&mut self, value: &[u8]) -> Result<(), GraphError> {
        let index = self.sink.bytes(value);
        self.push_index("bytes", index, value)
    }

    fn ty(&mut self, id: TypeId) -> Result<(), GraphError> {
        let index = self.sink.type_index(id);
        self.push_index("type", index, id)
    }

    fn function(&mut self, id: FunctionId) -> Result<(), GraphError> {
        let index = self.sink.function_index(id);
        self.push_index("function", index, id)
    }

    fn global(&mut self, id: GlobalId) -> Result<(), GraphError> {
        let index = self.sink.global_index(id);
        self.push_index("global", index, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pools where entry `i` of every scalar pool is derived from `i`
    struct Pools {
        strings: Vec<String>,
        bytes: Vec<Vec<u8>>,
    }

    impl Pools {
        fn new() -> Self {
            Self {
                strings: (0..8).map(|i| format!("s{}", i)).collect(),
                bytes: (0..8).map(|i| vec![i as u8; 2]).collect(),
            }
        }
    }

    impl OperandSource for Pools {
        fn int(&self, index: usize) -> Option<i32> {
            (index < 8).then(|| index as i32 * 10)
        }
        fn float(&self, index: usize) -> Option<f64> {
            (index < 8).then(|| index as f64 + 0.5)
        }
        fn string(&self, index: usize) -> Option<&str> {
            self.strings.get(index).map(String::as_str)
        }
        fn bytes(&self, index: usize) -> Option<&[u8]> {
            self.bytes.get(index).map(Vec::as_slice)
        }
        fn type_count(&self) -> usize {
            8
        }
        fn function_count(&self) -> usize {
            8
        }
        fn global_count(&self) -> usize {
            8
        }
    }

    impl OperandSink for Pools {
        fn int(&self, value: i32) -> Option<usize> {
            Some(value as usize / 10)
        }
        fn float(&self, value: f64) -> Option<usize> {
            Some(value as usize)
        }
        fn string(&self, value: &str) -> Option<usize> {
            self.strings.iter().position(|s| s == value)
        }
        fn bytes(&self, value: &[u8]) -> Option<usize> {
            self.bytes.iter().position(|b| b == value)
        }
        fn type_index(&self, id: TypeId) -> Option<usize> {
            (id.0 < 8).then_some(id.0)
        }
        fn function_index(&self, id: FunctionId) -> Option<usize> {
            (id.0 < 8).then_some(id.0)
        }
        fn global_index(&self, id: GlobalId) -> Option<usize> {
            (id.0 < 8).then_some(id.0)
        }
    }

    fn raw(opcode: Opcode, args: &[i32]) -> Instruction {
        Instruction::new(opcode, args.to_vec())
    }

    #[test]
    fn test_every_opcode_survives_resolve_and_flatten() {
        let pools = Pools::new();
        for opcode in Opcode::all() {
            let args = match opcode {
                Opcode::Switch => vec![1, 2, 3, 4],
                Opcode::Bool => vec![1, 1],
                Opcode::CallN => vec![1, 2, 3, 4, 5, 6, 7],
                _ => {
                    let fixed = opcode.fixed_args().unwrap_or(0);
                    let mut args: Vec<i32> = (1..=fixed as i32).collect();
                    if opcode.has_variable_args() {
                        args.extend([5, 6]);
                    }
                    args
                }
            };
            let instruction = Instruction::new(opcode, args);

            let op = Op::resolve(&instruction, &pools)
                .unwrap_or_else(|e| panic!("{:?}: {}", opcode, e));
            assert_eq!(op.opcode(), opcode);
            assert_eq!(op.flatten(&pools).unwrap(), instruction, "{:?}", opcode);
        }
    }

    #[test]
    fn test_pool_operands_resolve_to_values() {
        let pools = Pools::new();
        assert_eq!(
            Op::resolve(&raw(Opcode::Int, &[0, 4]), &pools).unwrap(),
            Op::Int { dst: Reg(0), value: 40 }
        );
        assert_eq!(
            Op::resolve(&raw(Opcode::Float, &[1, 2]), &pools).unwrap(),
            Op::Float { dst: Reg(1), value: 2.5 }
        );
        assert_eq!(
            Op::resolve(&raw(Opcode::DynSet, &[0, 3, 1]), &pools).unwrap(),
            Op::DynSet {
                obj: Reg(0),
                name: "s3".into(),
                src: Reg(1),
            }
        );
        assert_eq!(
            Op::resolve(&raw(Opcode::Bool, &[2, 7]), &pools).unwrap(),
            Op::Bool { dst: Reg(2), value: true }
        );
        assert_eq!(
            Op::resolve(&raw(Opcode::GetGlobal, &[2, 7]), &pools).unwrap(),
            Op::GetGlobal {
                dst: Reg(2),
                global: GlobalId(7),
            }
        );
    }

    #[test]
    fn test_calls_collapse_and_pick_narrowest_tag() {
        let pools = Pools::new();
        let op = Op::resolve(&raw(Opcode::Call2, &[0, 3, 1, 2]), &pools).unwrap();
        assert_eq!(
            op,
            Op::Call {
                dst: Reg(0),
                function: FunctionId(3),
                args: vec![Reg(1), Reg(2)],
            }
        );

        // A CallN with few arguments is narrowed on the way out
        let op = Op::resolve(&raw(Opcode::CallN, &[0, 3, 1]), &pools).unwrap();
        assert_eq!(op.flatten(&pools).unwrap(), raw(Opcode::Call1, &[0, 3, 1]));

        let five = Op::Call {
            dst: Reg(0),
            function: FunctionId(1),
            args: (1..=5).map(Reg).collect(),
        };
        assert_eq!(five.opcode(), Opcode::CallN);
        assert_eq!(five.function(), Some(FunctionId(1)));
    }

    #[test]
    fn test_switch_keeps_every_offset() {
        let pools = Pools::new();
        let op = Op::resolve(&raw(Opcode::Switch, &[3, 1, 2, 3, 9]), &pools).unwrap();
        assert_eq!(
            op,
            Op::Switch {
                reg: Reg(3),
                offsets: vec![1, 2, 3],
                default: 9,
            }
        );

        let result = Op::resolve(&raw(Opcode::Switch, &[3]), &pools);
        assert!(matches!(result, Err(GraphError::MissingOperand { opcode: "Switch", .. })));
    }

    #[test]
    fn test_malformed_operands() {
        let pools = Pools::new();
        assert!(matches!(
            Op::resolve(&raw(Opcode::Int, &[0, 8]), &pools),
            Err(GraphError::Missing { pool: "int", index: 8 })
        ));
        assert!(matches!(
            Op::resolve(&raw(Opcode::Type, &[0, -1]), &pools),
            Err(GraphError::Missing { pool: "type", index: -1 })
        ));
        assert!(matches!(
            Op::resolve(&raw(Opcode::Mov, &[-2, 0]), &pools),
            Err(GraphError::InvalidOperand { opcode: "Mov", position: 0, value: -2 })
        ));
        assert!(matches!(
            Op::resolve(&raw(Opcode::Field, &[0, 1]), &pools),
            Err(GraphError::MissingOperand { opcode: "Field", position: 2 })
        ));
        assert!(matches!(
            Op::resolve(&raw(Opcode::Ret, &[0, 1]), &pools),
            Err(GraphError::TrailingOperands { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_reference_is_dangling() {
        let pools = Pools::new();
        let op = Op::StaticClosure {
            dst: Reg(0),
            function: FunctionId(42),
        };
        assert!(matches!(
            op.flatten(&pools),
            Err(GraphError::DanglingReference { pool: "function", .. })
        ));

        let op = Op::String {
            dst: Reg(0),
            value: "absent".into(),
        };
        assert!(matches!(
            op.flatten(&pools),
            Err(GraphError::DanglingReference { pool: "string", .. })
        ));
    }

    #[test]
    fn test_pool_value() {
        let op = Op::DynGet {
            dst: Reg(0),
            obj: Reg(1),
            name: "x".into(),
        };
        assert_eq!(op.pool_value(), Some(PoolValue::String("x")));
        assert_eq!(Op::Nop.pool_value(), None);
    }
}
