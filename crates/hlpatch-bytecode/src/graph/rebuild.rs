//! Resolved graph back to a structural module
//!
//! Types and functions keep their arena positions. The int, float, string
//! and byte pools are rebuilt from scratch: every value is assigned an
//! index the first time it is seen, so equal values share one entry.
//! Debug information is not carried through the graph; the rebuilt module
//! has a single `nul` source file and every instruction at line 0.

use std::hash::Hash;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, info, info_span};

use super::op::OperandSink;
use super::{
    Field, FunctionBody, FunctionId, GlobalId, Graph, GraphError, ObjType, PoolValue, Signature,
    Type, TypeId,
};
use crate::debug::DebugPosition;
use crate::module::{self, Module};
use crate::parallel::ExecutionStrategy;
use crate::types::{
    EnumConstruct, EnumDef, FunSignature, ObjBinding, ObjDef, ObjField, ObjProto, TypeDef,
};

/// Source file name written to rebuilt modules
pub const PLACEHOLDER_FILE: &str = "nul";

/// First-seen deduplicating pool
struct Interner<K: ?Sized + ToOwned> {
    values: Vec<K::Owned>,
    index: FxHashMap<K::Owned, usize>,
}

impl<K> Interner<K>
where
    K: ?Sized + ToOwned + Hash + Eq,
    K::Owned: Hash + Eq,
{
    fn new() -> Self {
        Self {
            values: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    fn intern(&mut self, value: &K) -> usize {
        if let Some(&index) = self.index.get(value) {
            return index;
        }
        let index = self.values.len();
        self.values.push(value.to_owned());
        self.index.insert(value.to_owned(), index);
        index
    }

    fn get(&self, value: &K) -> Option<usize> {
        self.index.get(value).copied()
    }
}

/// Pools under construction plus the arena sizes references are checked
/// against
struct Pools {
    has_bytes_pool: bool,
    version: u8,
    ints: Interner<i32>,
    floats: Interner<u64>,
    strings: Interner<str>,
    bytes: Interner<[u8]>,
    types: usize,
    functions: usize,
    globals: usize,
}

impl Pools {
    fn new(graph: &Graph) -> Self {
        Self {
            has_bytes_pool: graph.version >= module::BYTES_POOL_VERSION,
            version: graph.version,
            ints: Interner::new(),
            floats: Interner::new(),
            strings: Interner::new(),
            bytes: Interner::new(),
            types: graph.types.len(),
            functions: graph.functions.len(),
            globals: graph.globals.len(),
        }
    }

    fn intern(&mut self, value: PoolValue<'_>) -> Result<(), GraphError> {
        match value {
            PoolValue::Int(v) => {
                self.ints.intern(&v);
            }
            PoolValue::Float(v) => {
                self.floats.intern(&v.to_bits());
            }
            PoolValue::String(v) => {
                self.strings.intern(v);
            }
            PoolValue::Bytes(v) if self.has_bytes_pool => {
                self.bytes.intern(v);
            }
            PoolValue::Bytes(v) => {
                let s = std::str::from_utf8(v).map_err(|_| GraphError::BytesNotUtf8 {
                    version: self.version,
                })?;
                self.strings.intern(s);
            }
        }
        Ok(())
    }

    fn type_ref(&self, id: TypeId) -> Result<usize, GraphError> {
        self.type_index(id).ok_or_else(|| dangling("type", id))
    }

    fn function_ref(&self, id: FunctionId) -> Result<usize, GraphError> {
        self.function_index(id).ok_or_else(|| dangling("function", id))
    }

    fn global_ref(&self, id: GlobalId) -> Result<usize, GraphError> {
        self.global_index(id).ok_or_else(|| dangling("global", id))
    }

    fn type_refs(&self, ids: &[TypeId]) -> Result<Vec<usize>, GraphError> {
        ids.iter().map(|&id| self.type_ref(id)).collect()
    }

    /// 1-based global slot, 0 meaning none
    fn global_slot(&self, id: Option<GlobalId>) -> Result<usize, GraphError> {
        id.map_or(Ok(0), |id| self.global_ref(id).map(|index| index + 1))
    }

    fn signature(&self, sig: &Signature) -> Result<FunSignature, GraphError> {
        Ok(FunSignature {
            args: self.type_refs(&sig.args)?,
            ret: self.type_ref(sig.ret)?,
        })
    }

    fn fields(&mut self, fields: &[Field]) -> Result<Vec<ObjField>, GraphError> {
        fields
            .iter()
            .map(|field| {
                Ok(ObjField {
                    name: self.strings.intern(&field.name),
                    ty: self.type_ref(field.ty)?,
                })
            })
            .collect()
    }

    fn obj(&mut self, obj: &ObjType) -> Result<ObjDef, GraphError> {
        let name = self.strings.intern(&obj.name);
        let super_type = match obj.super_type {
            Some(id) => i32::try_from(self.type_ref(id)?).map_err(|_| dangling("type", id))?,
            None => -1,
        };
        let global = self.global_slot(obj.global)?;
        let fields = self.fields(&obj.fields)?;

        let mut protos = Vec::with_capacity(obj.protos.len());
        for proto in &obj.protos {
            protos.push(ObjProto {
                name: self.strings.intern(&proto.name),
                function: self.function_ref(proto.function)?,
                pindex: proto.pindex,
            });
        }
        let bindings = obj
            .bindings
            .iter()
            .map(|binding| {
                Ok(ObjBinding {
                    field: binding.field,
                    function: self.function_ref(binding.function)?,
                })
            })
            .collect::<Result<_, GraphError>>()?;

        Ok(ObjDef {
            name,
            super_type,
            global,
            fields,
            protos,
            bindings,
        })
    }

    fn type_def(&mut self, ty: &Type) -> Result<TypeDef, GraphError> {
        Ok(match ty {
            Type::Void => TypeDef::Void,
            Type::U8 => TypeDef::U8,
            Type::U16 => TypeDef::U16,
            Type::I32 => TypeDef::I32,
            Type::I64 => TypeDef::I64,
            Type::F32 => TypeDef::F32,
            Type::F64 => TypeDef::F64,
            Type::Bool => TypeDef::Bool,
            Type::Bytes => TypeDef::Bytes,
            Type::Dyn => TypeDef::Dyn,
            Type::Array => TypeDef::Array,
            Type::Type => TypeDef::Type,
            Type::DynObj => TypeDef::DynObj,
            Type::Fun(sig) => TypeDef::Fun(self.signature(sig)?),
            Type::Method(sig) => TypeDef::Method(self.signature(sig)?),
            Type::Obj(obj) => TypeDef::Obj(self.obj(obj)?),
            Type::Struct(obj) => TypeDef::Struct(self.obj(obj)?),
            Type::Ref(inner) => TypeDef::Ref(self.type_ref(*inner)?),
            Type::Null(inner) => TypeDef::Null(self.type_ref(*inner)?),
            Type::Packed(inner) => TypeDef::Packed(self.type_ref(*inner)?),
            Type::Virtual(fields) => TypeDef::Virtual(self.fields(fields)?),
            Type::Abstract(name) => TypeDef::Abstract(self.strings.intern(name)),
            Type::Enum(def) => {
                let name = self.strings.intern(&def.name);
                let global = self.global_slot(def.global)?;
                let mut constructs = Vec::with_capacity(def.constructs.len());
                for construct in &def.constructs {
                    constructs.push(EnumConstruct {
                        name: self.strings.intern(&construct.name),
                        params: self.type_refs(&construct.params)?,
                    });
                }
                TypeDef::Enum(EnumDef {
                    name,
                    global,
                    constructs,
                })
            }
        })
    }
}

impl OperandSink for Pools {
    fn int(&self, value: i32) -> Option<usize> {
        self.ints.get(&value)
    }

    fn float(&self, value: f64) -> Option<usize> {
        self.floats.get(&value.to_bits())
    }

    fn string(&self, value: &str) -> Option<usize> {
        self.strings.get(value)
    }

    fn bytes(&self, value: &[u8]) -> Option<usize> {
        if self.has_bytes_pool {
            self.bytes.get(value)
        } else {
            std::str::from_utf8(value).ok().and_then(|s| self.strings.get(s))
        }
    }

    fn type_index(&self, id: TypeId) -> Option<usize> {
        (id.0 < self.types).then_some(id.0)
    }

    fn function_index(&self, id: FunctionId) -> Option<usize> {
        (id.0 < self.functions).then_some(id.0)
    }

    fn global_index(&self, id: GlobalId) -> Option<usize> {
        (id.0 < self.globals).then_some(id.0)
    }
}

fn dangling(pool: &'static str, value: impl std::fmt::Debug) -> GraphError {
    GraphError::DanglingReference {
        pool,
        value: format!("{:?}", value),
    }
}

impl Graph {
    /// Flatten the graph into a structural module
    pub fn rebuild(&self, strategy: ExecutionStrategy) -> Result<Module, GraphError> {
        let _span = info_span!("rebuild_module").entered();
        let start = Instant::now();
        let mut pools = Pools::new(self);

        // Names first, in type then native then constant order
        let mut types = Vec::with_capacity(self.types.len());
        for (i, ty) in self.types.iter().enumerate() {
            types.push(pools.type_def(ty).map_err(|e| e.at(format!("type {}", i)))?);
        }
        let globals = self
            .globals
            .iter()
            .enumerate()
            .map(|(i, g)| pools.type_ref(g.ty).map_err(|e| e.at(format!("global {}", i))))
            .collect::<Result<Vec<_>, _>>()?;

        let mut natives = Vec::new();
        for (index, function) in self.functions.iter().enumerate() {
            if let FunctionBody::Native(native) = &function.body {
                natives.push(module::Native {
                    lib: pools.strings.intern(&native.lib),
                    name: pools.strings.intern(&native.name),
                    ty: pools
                        .type_ref(function.ty)
                        .map_err(|e| e.at(format!("function {}", index)))?,
                    index,
                });
            }
        }

        let mut constants = Vec::with_capacity(self.constants.len());
        for (i, constant) in self.constants.iter().enumerate() {
            let global = pools
                .global_ref(constant.global)
                .map_err(|e| e.at(format!("constant {}", i)))?;
            let payload = pools.strings.intern(&constant.value);
            constants.push(module::Constant {
                global,
                fields: vec![payload, constant.value.len()],
            });
        }

        // Discover operand values, then assign indices in function order
        let discovered = strategy.map(&self.functions, |_, function| {
            function
                .as_method()
                .map(|method| method.ops.iter().filter_map(|op| op.pool_value()).collect::<Vec<_>>())
                .unwrap_or_default()
        });
        for (i, values) in discovered.into_iter().enumerate() {
            for value in values {
                pools
                    .intern(value)
                    .map_err(|e| e.at(format!("function {}", i)))?;
            }
        }

        // Pools are frozen from here on
        let frozen = &pools;
        let methods = strategy.try_map(&self.functions, |index, function| {
            let FunctionBody::Method(method) = &function.body else {
                return Ok(None);
            };
            let location = |e: GraphError| e.at(format!("function {}", index));

            let mut instructions = Vec::with_capacity(method.ops.len());
            for (position, op) in method.ops.iter().enumerate() {
                instructions.push(op.flatten(frozen).map_err(|e| {
                    e.at(format!("function {} instruction {}", index, position))
                })?);
            }

            debug!(function = index, ops = instructions.len(), "flattened method");
            Ok(Some(module::Method {
                ty: frozen.type_ref(function.ty).map_err(location)?,
                index,
                registers: frozen.type_refs(&method.registers).map_err(location)?,
                debug: Some(vec![DebugPosition::new(0, 0); instructions.len()]),
                assigns: Some(Vec::new()),
                instructions,
            }))
        })?;

        let entrypoint = pools
            .function_ref(self.entrypoint)
            .map_err(|e| e.at("entry point"))?;

        let Pools {
            ints,
            floats,
            strings,
            bytes,
            ..
        } = pools;
        let module = Module {
            version: self.version,
            has_debug: true,
            ints: ints.values,
            floats: floats.values.into_iter().map(f64::from_bits).collect(),
            strings: strings.values,
            bytes: bytes.values,
            debug_files: vec![PLACEHOLDER_FILE.to_string()],
            types,
            globals,
            natives,
            methods: methods.into_iter().flatten().collect(),
            constants,
            entrypoint,
        };

        info!(
            ints = module.ints.len(),
            floats = module.floats.len(),
            strings = module.strings.len(),
            bytes = module.bytes.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "rebuilt module"
        );
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Constant, Function, Global, Method, Native, Op, Reg};

    fn point() -> Type {
        Type::Obj(ObjType {
            name: "Point".into(),
            super_type: None,
            global: Some(GlobalId(0)),
            fields: vec![
                Field {
                    name: "x".into(),
                    ty: TypeId(2),
                },
                Field {
                    name: "y".into(),
                    ty: TypeId(2),
                },
            ],
            protos: vec![],
            bindings: vec![],
        })
    }

    fn graph(version: u8, ops: Vec<Op>) -> Graph {
        Graph {
            version,
            types: vec![
                Type::Void,
                Type::Fun(Signature {
                    args: vec![],
                    ret: TypeId(0),
                }),
                Type::I32,
                point(),
            ],
            functions: vec![
                Function {
                    ty: TypeId(1),
                    body: FunctionBody::Native(Native {
                        lib: "std".into(),
                        name: "log".into(),
                    }),
                },
                Function {
                    ty: TypeId(1),
                    body: FunctionBody::Method(Method {
                        name: Some("main".into()),
                        parent: None,
                        registers: vec![TypeId(2), TypeId(2), TypeId(0)],
                        ops,
                    }),
                },
            ],
            globals: vec![Global { ty: TypeId(3) }],
            constants: vec![Constant {
                global: GlobalId(0),
                value: "Point".into(),
            }],
            entrypoint: FunctionId(1),
        }
    }

    fn body() -> Vec<Op> {
        vec![
            Op::Int {
                dst: Reg(0),
                value: 42,
            },
            Op::Int {
                dst: Reg(1),
                value: 7,
            },
            Op::Int {
                dst: Reg(1),
                value: 42,
            },
            Op::Float {
                dst: Reg(0),
                value: 1.5,
            },
            Op::String {
                dst: Reg(0),
                value: "hi".into(),
            },
            Op::String {
                dst: Reg(1),
                value: "x".into(),
            },
            Op::Call {
                dst: Reg(2),
                function: FunctionId(0),
                args: vec![],
            },
            Op::Ret { reg: Reg(2) },
        ]
    }

    #[test]
    fn test_pools_are_deduplicated_in_first_seen_order() {
        let module = graph(5, body()).rebuild(ExecutionStrategy::Sequential).unwrap();
        assert_eq!(module.ints, vec![42, 7]);
        assert_eq!(module.floats, vec![1.5]);
        assert_eq!(module.strings, vec!["Point", "x", "y", "std", "log", "hi"]);

        let method = &module.methods[0];
        assert_eq!(method.instructions[0].args, vec![0, 0]);
        assert_eq!(method.instructions[1].args, vec![1, 1]);
        assert_eq!(method.instructions[2].args, vec![1, 0]);
        assert_eq!(method.instructions[4].args, vec![0, 5]);
        assert_eq!(method.instructions[5].args, vec![1, 1]);
        assert_eq!(method.instructions[6].opcode, crate::opcode::Opcode::Call0);
    }

    #[test]
    fn test_structure_is_preserved() {
        let module = graph(5, body()).rebuild(ExecutionStrategy::Parallel { threads: 2 }).unwrap();
        assert_eq!(module.version, 5);
        assert_eq!(module.types.len(), 4);
        assert_eq!(module.globals, vec![3]);
        assert_eq!(module.natives.len(), 1);
        assert_eq!(module.natives[0].index, 0);
        assert_eq!((module.natives[0].lib, module.natives[0].name), (3, 4));
        assert_eq!(module.methods.len(), 1);
        assert_eq!(module.methods[0].index, 1);
        assert_eq!(module.methods[0].registers, vec![2, 2, 0]);
        assert_eq!(module.entrypoint, 1);

        match &module.types[3] {
            TypeDef::Obj(obj) => {
                assert_eq!(obj.name, 0);
                assert_eq!(obj.global, 1);
                assert_eq!(obj.super_type, -1);
            }
            other => panic!("expected obj, got {:?}", other),
        }
    }

    #[test]
    fn test_constant_records_string_index_and_length() {
        let module = graph(5, body()).rebuild(ExecutionStrategy::Sequential).unwrap();
        assert_eq!(module.constants.len(), 1);
        assert_eq!(module.constants[0].global, 0);
        assert_eq!(module.constants[0].fields, vec![0, 5]);
    }

    #[test]
    fn test_debug_information_is_placeholder() {
        let module = graph(5, body()).rebuild(ExecutionStrategy::Sequential).unwrap();
        assert!(module.has_debug);
        assert_eq!(module.debug_files, vec![PLACEHOLDER_FILE]);

        let method = &module.methods[0];
        let positions = method.debug.as_ref().unwrap();
        assert_eq!(positions.len(), method.instructions.len());
        assert!(positions.iter().all(|p| *p == DebugPosition::new(0, 0)));
        assert_eq!(method.assigns.as_deref(), Some(&[][..]));
    }

    #[test]
    fn test_bytes_pool_by_version() {
        let ops = vec![
            Op::Bytes {
                dst: Reg(0),
                value: b"abc".to_vec(),
            },
            Op::Ret { reg: Reg(0) },
        ];

        let v5 = graph(5, ops.clone()).rebuild(ExecutionStrategy::Sequential).unwrap();
        assert_eq!(v5.bytes, vec![b"abc".to_vec()]);
        assert_eq!(v5.methods[0].instructions[0].args, vec![0, 0]);

        let v4 = graph(4, ops).rebuild(ExecutionStrategy::Sequential).unwrap();
        assert!(v4.bytes.is_empty());
        assert_eq!(v4.strings.last().map(String::as_str), Some("abc"));
        assert_eq!(
            v4.methods[0].instructions[0].args,
            vec![0, v4.strings.len() as i32 - 1]
        );
    }

    #[test]
    fn test_non_utf8_bytes_rejected_before_bytes_pool() {
        let ops = vec![Op::Bytes {
            dst: Reg(0),
            value: vec![0xff, 0xfe],
        }];
        let err = graph(4, ops).rebuild(ExecutionStrategy::Sequential).unwrap_err();
        match err {
            GraphError::At { location, source } => {
                assert_eq!(location, "function 1");
                assert!(matches!(*source, GraphError::BytesNotUtf8 { version: 4 }));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_dangling_function_reference() {
        let ops = vec![Op::StaticClosure {
            dst: Reg(0),
            function: FunctionId(99),
        }];
        let err = graph(5, ops).rebuild(ExecutionStrategy::Sequential).unwrap_err();
        assert_eq!(err.to_string().split(':').next(), Some("function 1 instruction 0"));
        match err {
            GraphError::At { source, .. } => assert!(matches!(
                *source,
                GraphError::DanglingReference {
                    pool: "function",
                    ..
                }
            )),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_dangling_type_reference() {
        let mut graph = graph(5, body());
        graph.globals.push(Global { ty: TypeId(40) });
        let err = graph.rebuild(ExecutionStrategy::Sequential).unwrap_err();
        assert!(err.to_string().starts_with("global 1"));
    }

    #[test]
    fn test_strategies_agree() {
        let g = graph(5, body());
        let sequential = g.rebuild(ExecutionStrategy::Sequential).unwrap();
        let parallel = g.rebuild(ExecutionStrategy::Parallel { threads: 4 }).unwrap();
        assert_eq!(sequential.encode().unwrap(), parallel.encode().unwrap());
    }
}
