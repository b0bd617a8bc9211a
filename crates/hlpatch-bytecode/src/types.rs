//! Type descriptors
//!
//! Types are stored in the module's type pool as a one-byte kind tag followed
//! by a kind-specific payload. Every integer in a payload is a varint and
//! every list is prefixed by its count.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError, EncodeError};

/// Type kind tag
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// No value
    Void = 0,
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Signed 32-bit integer
    I32 = 3,
    /// Signed 64-bit integer
    I64 = 4,
    /// 32-bit float
    F32 = 5,
    /// 64-bit float
    F64 = 6,
    /// Boolean
    Bool = 7,
    /// Raw bytes pointer
    Bytes = 8,
    /// Dynamic value
    Dyn = 9,
    /// Function signature
    Fun = 10,
    /// Class instance
    Obj = 11,
    /// Native array
    Array = 12,
    /// Type value
    Type = 13,
    /// Reference
    Ref = 14,
    /// Anonymous structural type
    Virtual = 15,
    /// Dynamic object
    DynObj = 16,
    /// Opaque host type
    Abstract = 17,
    /// Enum
    Enum = 18,
    /// Nullable wrapper
    Null = 19,
    /// Method signature
    Method = 20,
    /// Value struct
    Struct = 21,
    /// Packed wrapper
    Packed = 22,
}

impl TypeKind {
    /// Convert a wire tag to a kind
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Void,
            1 => Self::U8,
            2 => Self::U16,
            3 => Self::I32,
            4 => Self::I64,
            5 => Self::F32,
            6 => Self::F64,
            7 => Self::Bool,
            8 => Self::Bytes,
            9 => Self::Dyn,
            10 => Self::Fun,
            11 => Self::Obj,
            12 => Self::Array,
            13 => Self::Type,
            14 => Self::Ref,
            15 => Self::Virtual,
            16 => Self::DynObj,
            17 => Self::Abstract,
            18 => Self::Enum,
            19 => Self::Null,
            20 => Self::Method,
            21 => Self::Struct,
            22 => Self::Packed,
            _ => return None,
        })
    }

    /// Wire tag
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Function or method signature
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunSignature {
    /// Argument type indices
    pub args: Vec<usize>,
    /// Return type index
    pub ret: usize,
}

/// Named, typed field of an object or virtual
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjField {
    /// Name string index
    pub name: usize,
    /// Type index
    pub ty: usize,
}

/// Dispatch-table entry of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjProto {
    /// Name string index
    pub name: usize,
    /// Function index
    pub function: usize,
    /// Polymorphic slot, `-1` when not virtual
    pub pindex: i32,
}

/// Field-to-function binding of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjBinding {
    /// Index into the object's full (inherited-first) field list
    pub field: usize,
    /// Function index
    pub function: usize,
}

/// Object or struct layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjDef {
    /// Name string index
    pub name: usize,
    /// Superclass type index, negative when there is none
    pub super_type: i32,
    /// Global slot holding the class value, 1-based, `0` when there is none
    pub global: usize,
    /// Own fields
    pub fields: Vec<ObjField>,
    /// Dispatch table
    pub protos: Vec<ObjProto>,
    /// Field bindings
    pub bindings: Vec<ObjBinding>,
}

impl ObjDef {
    /// Superclass type index, if any
    pub fn superclass(&self) -> Option<usize> {
        usize::try_from(self.super_type).ok()
    }

    /// 0-based global slot, if any
    pub fn global_slot(&self) -> Option<usize> {
        self.global.checked_sub(1)
    }
}

/// Enum constructor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumConstruct {
    /// Name string index
    pub name: usize,
    /// Parameter type indices
    pub params: Vec<usize>,
}

/// Enum layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    /// Name string index
    pub name: usize,
    /// Global slot, 1-based, `0` when there is none
    pub global: usize,
    /// Constructors
    pub constructs: Vec<EnumConstruct>,
}

impl EnumDef {
    /// 0-based global slot, if any
    pub fn global_slot(&self) -> Option<usize> {
        self.global.checked_sub(1)
    }
}

/// Raw type descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDef {
    /// `void`
    Void,
    /// `u8`
    U8,
    /// `u16`
    U16,
    /// `i32`
    I32,
    /// `i64`
    I64,
    /// `f32`
    F32,
    /// `f64`
    F64,
    /// `bool`
    Bool,
    /// `bytes`
    Bytes,
    /// `dyn`
    Dyn,
    /// Function signature
    Fun(FunSignature),
    /// Class
    Obj(ObjDef),
    /// `array`
    Array,
    /// `type`
    Type,
    /// Reference to a type index
    Ref(usize),
    /// Virtual with its fields
    Virtual(Vec<ObjField>),
    /// `dynobj`
    DynObj,
    /// Abstract with its name string index
    Abstract(usize),
    /// Enum
    Enum(EnumDef),
    /// Nullable wrapper of a type index
    Null(usize),
    /// Method signature
    Method(FunSignature),
    /// Struct
    Struct(ObjDef),
    /// Packed wrapper of a type index
    Packed(usize),
}

impl TypeDef {
    /// Kind tag of this descriptor
    pub fn kind(&self) -> TypeKind {
        match self {
            Self::Void => TypeKind::Void,
            Self::U8 => TypeKind::U8,
            Self::U16 => TypeKind::U16,
            Self::I32 => TypeKind::I32,
            Self::I64 => TypeKind::I64,
            Self::F32 => TypeKind::F32,
            Self::F64 => TypeKind::F64,
            Self::Bool => TypeKind::Bool,
            Self::Bytes => TypeKind::Bytes,
            Self::Dyn => TypeKind::Dyn,
            Self::Fun(_) => TypeKind::Fun,
            Self::Obj(_) => TypeKind::Obj,
            Self::Array => TypeKind::Array,
            Self::Type => TypeKind::Type,
            Self::Ref(_) => TypeKind::Ref,
            Self::Virtual(_) => TypeKind::Virtual,
            Self::DynObj => TypeKind::DynObj,
            Self::Abstract(_) => TypeKind::Abstract,
            Self::Enum(_) => TypeKind::Enum,
            Self::Null(_) => TypeKind::Null,
            Self::Method(_) => TypeKind::Method,
            Self::Struct(_) => TypeKind::Struct,
            Self::Packed(_) => TypeKind::Packed,
        }
    }

    /// Encode the descriptor
    pub fn encode(&self, writer: &mut BytecodeWriter) -> Result<(), EncodeError> {
        writer.emit_u8(self.kind().to_u8());

        match self {
            Self::Fun(sig) | Self::Method(sig) => {
                writer.emit_index(sig.args.len())?;
                for &arg in &sig.args {
                    writer.emit_index(arg)?;
                }
                writer.emit_index(sig.ret)?;
            }
            Self::Obj(obj) | Self::Struct(obj) => {
                writer.emit_index(obj.name)?;
                writer.emit_varint(obj.super_type)?;
                writer.emit_index(obj.global)?;
                writer.emit_index(obj.fields.len())?;
                writer.emit_index(obj.protos.len())?;
                writer.emit_index(obj.bindings.len())?;
                encode_fields(writer, &obj.fields)?;
                for proto in &obj.protos {
                    writer.emit_index(proto.name)?;
                    writer.emit_index(proto.function)?;
                    writer.emit_varint(proto.pindex)?;
                }
                for binding in &obj.bindings {
                    writer.emit_index(binding.field)?;
                    writer.emit_index(binding.function)?;
                }
            }
            Self::Ref(inner) | Self::Null(inner) | Self::Packed(inner) => {
                writer.emit_index(*inner)?;
            }
            Self::Virtual(fields) => {
                writer.emit_index(fields.len())?;
                encode_fields(writer, fields)?;
            }
            Self::Abstract(name) => {
                writer.emit_index(*name)?;
            }
            Self::Enum(def) => {
                writer.emit_index(def.name)?;
                writer.emit_index(def.global)?;
                writer.emit_index(def.constructs.len())?;
                for construct in &def.constructs {
                    writer.emit_index(construct.name)?;
                    writer.emit_index(construct.params.len())?;
                    for &param in &construct.params {
                        writer.emit_index(param)?;
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Decode a descriptor
    pub fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        let tag = reader.read_u8()?;
        let kind = TypeKind::from_u8(tag).ok_or(DecodeError::UnknownTypeKind(tag, offset))?;

        Ok(match kind {
            TypeKind::Void => Self::Void,
            TypeKind::U8 => Self::U8,
            TypeKind::U16 => Self::U16,
            TypeKind::I32 => Self::I32,
            TypeKind::I64 => Self::I64,
            TypeKind::F32 => Self::F32,
            TypeKind::F64 => Self::F64,
            TypeKind::Bool => Self::Bool,
            TypeKind::Bytes => Self::Bytes,
            TypeKind::Dyn => Self::Dyn,
            TypeKind::Array => Self::Array,
            TypeKind::Type => Self::Type,
            TypeKind::DynObj => Self::DynObj,
            TypeKind::Fun => Self::Fun(decode_signature(reader)?),
            TypeKind::Method => Self::Method(decode_signature(reader)?),
            TypeKind::Obj => Self::Obj(decode_obj(reader)?),
            TypeKind::Struct => Self::Struct(decode_obj(reader)?),
            TypeKind::Ref => Self::Ref(reader.read_index()?),
            TypeKind::Null => Self::Null(reader.read_index()?),
            TypeKind::Packed => Self::Packed(reader.read_index()?),
            TypeKind::Virtual => {
                let count = reader.read_count()?;
                Self::Virtual(decode_fields(reader, count)?)
            }
            TypeKind::Abstract => Self::Abstract(reader.read_index()?),
            TypeKind::Enum => {
                let name = reader.read_index()?;
                let global = reader.read_index()?;
                let count = reader.read_count()?;
                let mut constructs = Vec::new();
                for _ in 0..count {
                    let name = reader.read_index()?;
                    let nparams = reader.read_count()?;
                    let mut params = Vec::with_capacity(nparams);
                    for _ in 0..nparams {
                        params.push(reader.read_index()?);
                    }
                    constructs.push(EnumConstruct { name, params });
                }
                Self::Enum(EnumDef {
                    name,
                    global,
                    constructs,
                })
            }
        })
    }

    /// Object or struct layout, if this is one
    pub fn as_obj(&self) -> Option<&ObjDef> {
        match self {
            Self::Obj(obj) | Self::Struct(obj) => Some(obj),
            _ => None,
        }
    }

    /// Function or method signature, if this is one
    pub fn as_signature(&self) -> Option<&FunSignature> {
        match self {
            Self::Fun(sig) | Self::Method(sig) => Some(sig),
            _ => None,
        }
    }
}

fn encode_fields(writer: &mut BytecodeWriter, fields: &[ObjField]) -> Result<(), EncodeError> {
    for field in fields {
        writer.emit_index(field.name)?;
        writer.emit_index(field.ty)?;
    }
    Ok(())
}

fn decode_fields(reader: &mut BytecodeReader<'_>, count: usize) -> Result<Vec<ObjField>, DecodeError> {
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let name = reader.read_index()?;
        let ty = reader.read_index()?;
        fields.push(ObjField { name, ty });
    }
    Ok(fields)
}

fn decode_signature(reader: &mut BytecodeReader<'_>) -> Result<FunSignature, DecodeError> {
    let count = reader.read_count()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(reader.read_index()?);
    }
    let ret = reader.read_index()?;
    Ok(FunSignature { args, ret })
}

fn decode_obj(reader: &mut BytecodeReader<'_>) -> Result<ObjDef, DecodeError> {
    let name = reader.read_index()?;
    let super_type = reader.read_varint()?;
    let global = reader.read_index()?;
    let nfields = reader.read_count()?;
    let nprotos = reader.read_count()?;
    let nbindings = reader.read_count()?;

    let fields = decode_fields(reader, nfields)?;

    let mut protos = Vec::with_capacity(nprotos);
    for _ in 0..nprotos {
        let name = reader.read_index()?;
        let function = reader.read_index()?;
        let pindex = reader.read_varint()?;
        protos.push(ObjProto {
            name,
            function,
            pindex,
        });
    }

    let mut bindings = Vec::with_capacity(nbindings);
    for _ in 0..nbindings {
        let field = reader.read_index()?;
        let function = reader.read_index()?;
        bindings.push(ObjBinding { field, function });
    }

    Ok(ObjDef {
        name,
        super_type,
        global,
        fields,
        protos,
        bindings,
    })
}
