//! Resolved object graph
//!
//! Types, functions and globals live in arenas addressed by [`TypeId`],
//! [`FunctionId`] and [`GlobalId`]. Every index a [`Module`] stores is
//! replaced by an id or, for scalar and string pools, by the value itself.
//! The function arena is ordered by function index, so `FunctionId(i)` is
//! function index `i` in both the source module and the rebuilt one.
//!
//! [`Module`]: crate::module::Module

mod build;
mod op;
mod rebuild;

use std::fmt;

use thiserror::Error;

use crate::types::TypeKind;

pub use op::{Op, PoolValue, Reg};
pub use rebuild::PLACEHOLDER_FILE;

/// Graph resolution errors
#[derive(Debug, Error)]
pub enum GraphError {
    /// Index with no pool entry behind it
    #[error("{pool} index {index} does not exist")]
    Missing {
        /// Pool name
        pool: &'static str,
        /// Offending index
        index: i64,
    },

    /// Raw instruction shorter than its opcode needs
    #[error("{opcode}: missing operand {position}")]
    MissingOperand {
        /// Opcode name
        opcode: &'static str,
        /// Operand position
        position: usize,
    },

    /// Register operand that is negative
    #[error("{opcode}: operand {position} has invalid register {value}")]
    InvalidOperand {
        /// Opcode name
        opcode: &'static str,
        /// Operand position
        position: usize,
        /// Raw value
        value: i32,
    },

    /// Raw instruction longer than its opcode allows
    #[error("{opcode}: expected {expected} operands, got {actual}")]
    TrailingOperands {
        /// Opcode name
        opcode: &'static str,
        /// Operands consumed
        expected: usize,
        /// Operands present
        actual: usize,
    },

    /// Reference to a node or value absent from the rebuilt pools
    #[error("Dangling {pool} reference {value}")]
    DanglingReference {
        /// Pool name
        pool: &'static str,
        /// The unresolved reference
        value: String,
    },

    /// A type of the wrong kind where a specific kind is required
    #[error("Type {ty} is {actual:?}, expected {expected}")]
    UnexpectedKind {
        /// Type index
        ty: usize,
        /// Actual kind
        actual: TypeKind,
        /// Expected kind
        expected: &'static str,
    },

    /// Function index outside `0..natives + methods`
    #[error("Function index {index} outside the index space of {count} functions")]
    FunctionIndexGap {
        /// Offending index
        index: usize,
        /// Combined function count
        count: usize,
    },

    /// Two functions share an index
    #[error("Duplicate function index {0}")]
    DuplicateFunction(usize),

    /// A method bound to more than one object field
    #[error("Function {function} has multiple bindings")]
    MultipleBindings {
        /// Function index
        function: usize,
    },

    /// Constant record without a string payload
    #[error("Constant for global {global} has no string payload")]
    InvalidConstant {
        /// Global slot
        global: usize,
    },

    /// Byte operand that has to live in the string pool but is not UTF-8
    #[error("Bytes operand is not valid UTF-8 and version {version} has no byte pool")]
    BytesNotUtf8 {
        /// Module version
        version: u8,
    },

    /// Superclass chain that loops back on itself
    #[error("Superclass cycle through type {0}")]
    SuperclassCycle(usize),

    /// Error with the entity it occurred in
    #[error("{location}: {source}")]
    At {
        /// Entity description
        location: String,
        /// Underlying error
        #[source]
        source: Box<GraphError>,
    },
}

impl GraphError {
    fn at(self, location: impl fmt::Display) -> Self {
        Self::At {
            location: location.to_string(),
            source: Box::new(self),
        }
    }
}

/// Handle of a type node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub usize);

/// Handle of a function node; equal to the function index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub usize);

/// Handle of a global slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub usize);

/// Function or method signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Argument types
    pub args: Vec<TypeId>,
    /// Return type
    pub ret: TypeId,
}

/// Named, typed field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: TypeId,
}

/// Dispatch-table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proto {
    /// Method name
    pub name: String,
    /// Implementation
    pub function: FunctionId,
    /// Polymorphic slot, `-1` when not virtual
    pub pindex: i32,
}

/// Field-to-function binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Index into the owner's full field list
    pub field: usize,
    /// Bound function
    pub function: FunctionId,
}

/// Class or struct layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjType {
    /// Type name
    pub name: String,
    /// Superclass
    pub super_type: Option<TypeId>,
    /// Global slot holding the class value
    pub global: Option<GlobalId>,
    /// Own fields, superclass fields excluded
    pub fields: Vec<Field>,
    /// Dispatch table
    pub protos: Vec<Proto>,
    /// Field bindings
    pub bindings: Vec<Binding>,
}

/// Enum constructor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumConstruct {
    /// Constructor name
    pub name: String,
    /// Parameter types
    pub params: Vec<TypeId>,
}

/// Enum layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumType {
    /// Enum name
    pub name: String,
    /// Global slot holding the enum value
    pub global: Option<GlobalId>,
    /// Constructors
    pub constructs: Vec<EnumConstruct>,
}

/// Type node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// No value
    Void,
    /// Unsigned 8-bit integer
    U8,
    /// Unsigned 16-bit integer
    U16,
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// Boolean
    Bool,
    /// Raw byte buffer
    Bytes,
    /// Dynamic value
    Dyn,
    /// Function signature
    Fun(Signature),
    /// Class
    Obj(ObjType),
    /// Dynamic array
    Array,
    /// Type-of-type value
    Type,
    /// Reference to a value of the wrapped type
    Ref(TypeId),
    /// Anonymous structural type
    Virtual(Vec<Field>),
    /// Dynamic object
    DynObj,
    /// Named opaque type
    Abstract(String),
    /// Enum
    Enum(EnumType),
    /// Nullable wrapper
    Null(TypeId),
    /// Method signature, receiver included
    Method(Signature),
    /// Value-layout class
    Struct(ObjType),
    /// Packed wrapper
    Packed(TypeId),
}

impl Type {
    /// Kind tag of this node
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

    /// Name of a class, struct, enum or abstract
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Obj(obj) | Self::Struct(obj) => Some(&obj.name),
            Self::Enum(def) => Some(&def.name),
            Self::Abstract(name) => Some(name),
            _ => None,
        }
    }

    /// Class or struct layout
    pub fn as_obj(&self) -> Option<&ObjType> {
        match self {
            Self::Obj(obj) | Self::Struct(obj) => Some(obj),
            _ => None,
        }
    }

    /// Class or struct layout, mutably
    pub fn as_obj_mut(&mut self) -> Option<&mut ObjType> {
        match self {
            Self::Obj(obj) | Self::Struct(obj) => Some(obj),
            _ => None,
        }
    }

    /// Function or method signature
    pub fn as_signature(&self) -> Option<&Signature> {
        match self {
            Self::Fun(sig) | Self::Method(sig) => Some(sig),
            _ => None,
        }
    }
}

/// Host-implemented function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Native {
    /// Library name
    pub lib: String,
    /// Function name
    pub name: String,
}

/// Bytecode-implemented function
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    /// Name given by a proto or binding
    pub name: Option<String>,
    /// Type whose proto or binding names this method
    pub parent: Option<TypeId>,
    /// Register types
    pub registers: Vec<TypeId>,
    /// Instructions
    pub ops: Vec<Op>,
}

impl Method {
    /// Index of the first instruction matching `pred`
    pub fn position(&self, pred: impl Fn(&Op) -> bool) -> Option<usize> {
        self.ops.iter().position(pred)
    }
}

/// Native or method body
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    /// Host function
    Native(Native),
    /// Bytecode function
    Method(Method),
}

/// Function node
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Function type
    pub ty: TypeId,
    /// Body
    pub body: FunctionBody,
}

impl Function {
    /// Method body, if this is a method
    pub fn as_method(&self) -> Option<&Method> {
        match &self.body {
            FunctionBody::Method(method) => Some(method),
            FunctionBody::Native(_) => None,
        }
    }

    /// Method body, mutably
    pub fn as_method_mut(&mut self) -> Option<&mut Method> {
        match &mut self.body {
            FunctionBody::Method(method) => Some(method),
            FunctionBody::Native(_) => None,
        }
    }

    /// Native description, if this is a native
    pub fn as_native(&self) -> Option<&Native> {
        match &self.body {
            FunctionBody::Native(native) => Some(native),
            FunctionBody::Method(_) => None,
        }
    }
}

/// Global slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Global {
    /// Slot type
    pub ty: TypeId,
}

/// Initial string value of a global slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constant {
    /// Global slot
    pub global: GlobalId,
    /// Payload
    pub value: String,
}

/// A module in resolved form
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    /// Bytecode version of the source module
    pub version: u8,
    /// Type arena
    pub types: Vec<Type>,
    /// Function arena, ordered by function index
    pub functions: Vec<Function>,
    /// Global slots
    pub globals: Vec<Global>,
    /// Constants
    pub constants: Vec<Constant>,
    /// Entry point
    pub entrypoint: FunctionId,
}

impl Graph {
    /// Type node by id
    pub fn ty(&self, id: TypeId) -> Option<&Type> {
        self.types.get(id.0)
    }

    /// Type node by id, mutably
    pub fn ty_mut(&mut self, id: TypeId) -> Option<&mut Type> {
        self.types.get_mut(id.0)
    }

    /// Function node by id
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0)
    }

    /// Function node by id, mutably
    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(id.0)
    }

    /// Function node by function index
    pub fn function_by_index(&self, index: usize) -> Option<&Function> {
        self.function(FunctionId(index))
    }

    /// Method body by id
    pub fn method(&self, id: FunctionId) -> Option<&Method> {
        self.function(id).and_then(Function::as_method)
    }

    /// Method body by id, mutably
    pub fn method_mut(&mut self, id: FunctionId) -> Option<&mut Method> {
        self.function_mut(id).and_then(Function::as_method_mut)
    }

    /// Display name of a function
    ///
    /// Natives are `lib.name`. Methods are `Parent.name` when a proto or
    /// binding named them, `name` when the parent is unnamed, and
    /// `anonymous@index` otherwise.
    pub fn full_name(&self, id: FunctionId) -> Option<String> {
        let function = self.function(id)?;
        let name = match &function.body {
            FunctionBody::Native(native) => format!("{}.{}", native.lib, native.name),
            FunctionBody::Method(method) => match &method.name {
                Some(name) => match method.parent.and_then(|p| self.ty(p)).and_then(Type::name) {
                    Some(parent) => format!("{}.{}", parent, name),
                    None => name.clone(),
                },
                None => format!("anonymous@{}", id.0),
            },
        };
        Some(name)
    }

    /// Iterate over method ids
    pub fn method_ids(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.as_method().is_some())
            .map(|(i, _)| FunctionId(i))
    }

    /// First method whose full name is `name`
    pub fn find_method_by_name(&self, name: &str) -> Option<FunctionId> {
        self.method_ids()
            .find(|&id| self.full_name(id).as_deref() == Some(name))
    }

    /// First class, struct, enum or abstract named `name`
    pub fn find_type_by_name(&self, name: &str) -> Option<TypeId> {
        self.types.iter().position(|ty| ty.name() == Some(name)).map(TypeId)
    }

    /// Full field list of a class or struct, superclass fields first
    pub fn all_fields(&self, id: TypeId) -> Result<Vec<&Field>, GraphError> {
        let mut chain = Vec::new();
        let mut current = Some(id);

        while let Some(ty) = current {
            if chain.len() > self.types.len() {
                return Err(GraphError::SuperclassCycle(id.0));
            }
            let node = self.ty(ty).ok_or(GraphError::Missing {
                pool: "type",
                index: ty.0 as i64,
            })?;
            let obj = node.as_obj().ok_or(GraphError::UnexpectedKind {
                ty: ty.0,
                actual: node.kind(),
                expected: "object",
            })?;
            chain.push(obj);
            current = obj.super_type;
        }

        Ok(chain.into_iter().rev().flat_map(|obj| obj.fields.iter()).collect())
    }

    /// Append a type node
    pub fn add_type(&mut self, ty: Type) -> TypeId {
        self.types.push(ty);
        TypeId(self.types.len() - 1)
    }

    /// Append a function; its function index is its arena position
    pub fn add_function(&mut self, function: Function) -> FunctionId {
        self.functions.push(function);
        FunctionId(self.functions.len() - 1)
    }

    /// Append a global slot
    pub fn add_global(&mut self, ty: TypeId) -> GlobalId {
        self.globals.push(Global { ty });
        GlobalId(self.globals.len() - 1)
    }

    /// Append a constant
    pub fn add_constant(&mut self, global: GlobalId, value: impl Into<String>) {
        self.constants.push(Constant {
            global,
            value: value.into(),
        });
    }

    /// Constant payload of a global slot
    pub fn constant_mut(&mut self, global: GlobalId) -> Option<&mut String> {
        self.constants
            .iter_mut()
            .find(|c| c.global == global)
            .map(|c| &mut c.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str, super_type: Option<TypeId>, fields: &[&str]) -> Type {
        Type::Obj(ObjType {
            name: name.into(),
            super_type,
            global: None,
            fields: fields
                .iter()
                .map(|f| Field {
                    name: (*f).into(),
                    ty: TypeId(0),
                })
                .collect(),
            protos: vec![],
            bindings: vec![],
        })
    }

    fn method(name: Option<&str>, parent: Option<TypeId>) -> Function {
        Function {
            ty: TypeId(0),
            body: FunctionBody::Method(Method {
                name: name.map(Into::into),
                parent,
                registers: vec![],
                ops: vec![Op::Ret { reg: Reg(0) }],
            }),
        }
    }

    fn graph() -> Graph {
        Graph {
            version: 5,
            types: vec![
                Type::Void,
                obj("Base", None, &["a", "b"]),
                obj("Child", Some(TypeId(1)), &["c"]),
                Type::Abstract("hl_socket".into()),
            ],
            functions: vec![
                Function {
                    ty: TypeId(0),
                    body: FunctionBody::Native(Native {
                        lib: "std".into(),
                        name: "log".into(),
                    }),
                },
                method(Some("update"), Some(TypeId(2))),
                method(Some("main"), None),
                method(None, None),
            ],
            globals: vec![Global { ty: TypeId(2) }],
            constants: vec![],
            entrypoint: FunctionId(2),
        }
    }

    #[test]
    fn test_full_names() {
        let graph = graph();
        assert_eq!(graph.full_name(FunctionId(0)).unwrap(), "std.log");
        assert_eq!(graph.full_name(FunctionId(1)).unwrap(), "Child.update");
        assert_eq!(graph.full_name(FunctionId(2)).unwrap(), "main");
        assert_eq!(graph.full_name(FunctionId(3)).unwrap(), "anonymous@3");
        assert_eq!(graph.full_name(FunctionId(4)), None);
    }

    #[test]
    fn test_lookups() {
        let graph = graph();
        assert_eq!(graph.find_method_by_name("Child.update"), Some(FunctionId(1)));
        assert_eq!(graph.find_method_by_name("std.log"), None);
        assert_eq!(graph.find_type_by_name("Child"), Some(TypeId(2)));
        assert_eq!(graph.find_type_by_name("hl_socket"), Some(TypeId(3)));
        assert_eq!(graph.find_type_by_name("Missing"), None);
        assert!(graph.function_by_index(0).unwrap().as_native().is_some());
        assert!(graph.method(FunctionId(0)).is_none());
        assert_eq!(graph.method_ids().count(), 3);
    }

    #[test]
    fn test_all_fields_superclass_first() {
        let graph = graph();
        let names: Vec<&str> = graph
            .all_fields(TypeId(2))
            .unwrap()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);

        assert!(matches!(
            graph.all_fields(TypeId(0)),
            Err(GraphError::UnexpectedKind { ty: 0, expected: "object", .. })
        ));
    }

    #[test]
    fn test_superclass_cycle_detected() {
        let mut graph = graph();
        if let Some(base) = graph.ty_mut(TypeId(1)).and_then(Type::as_obj_mut) {
            base.super_type = Some(TypeId(2));
        }
        assert!(matches!(graph.all_fields(TypeId(2)), Err(GraphError::SuperclassCycle(2))));
    }

    #[test]
    fn test_append_nodes() {
        let mut graph = graph();
        let ty = graph.add_type(Type::I32);
        assert_eq!(ty, TypeId(4));
        let global = graph.add_global(ty);
        assert_eq!(global, GlobalId(1));
        graph.add_constant(global, "hello");
        *graph.constant_mut(global).unwrap() = "patched".into();
        assert_eq!(graph.constants[0].value, "patched");
        assert_eq!(graph.add_function(method(None, None)), FunctionId(4));
    }

    #[test]
    fn test_error_context() {
        let err = GraphError::Missing {
            pool: "type",
            index: 9,
        }
        .at("function 3");
        assert_eq!(err.to_string(), "function 3: type index 9 does not exist");
    }
}
