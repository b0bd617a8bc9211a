//! Structural module to resolved graph

use std::time::Instant;

use tracing::{debug, info, info_span};

use super::op::OperandSource;
use super::{
    Binding, Constant, EnumConstruct, EnumType, Field, Function, FunctionBody, FunctionId, Global,
    Graph, GraphError, GlobalId, Method, Native, ObjType, Op, Proto, Signature, Type, TypeId,
};
use crate::module::{self, Module};
use crate::parallel::ExecutionStrategy;
use crate::types::{FunSignature, ObjDef, ObjField, TypeDef};

/// Function pool entry at a given function index
#[derive(Clone, Copy)]
enum Slot<'m> {
    Native(&'m module::Native),
    Method(&'m module::Method),
}

struct Resolver<'m> {
    module: &'m Module,
}

impl Resolver<'_> {
    fn ty(&self, index: usize) -> Result<TypeId, GraphError> {
        if index < self.module.types.len() {
            Ok(TypeId(index))
        } else {
            Err(missing("type", index))
        }
    }

    fn function(&self, index: usize) -> Result<FunctionId, GraphError> {
        if index < self.module.function_count() {
            Ok(FunctionId(index))
        } else {
            Err(missing("function", index))
        }
    }

    fn global(&self, index: usize) -> Result<GlobalId, GraphError> {
        if index < self.module.globals.len() {
            Ok(GlobalId(index))
        } else {
            Err(missing("global", index))
        }
    }

    /// 1-based slot, 0 meaning none
    fn global_slot(&self, slot: usize) -> Result<Option<GlobalId>, GraphError> {
        slot.checked_sub(1).map(|index| self.global(index)).transpose()
    }

    fn string(&self, index: usize) -> Result<String, GraphError> {
        self.module
            .strings
            .get(index)
            .cloned()
            .ok_or_else(|| missing("string", index))
    }

    fn types(&self, indices: &[usize]) -> Result<Vec<TypeId>, GraphError> {
        indices.iter().map(|&index| self.ty(index)).collect()
    }

    fn signature(&self, sig: &FunSignature) -> Result<Signature, GraphError> {
        Ok(Signature {
            args: self.types(&sig.args)?,
            ret: self.ty(sig.ret)?,
        })
    }

    fn fields(&self, fields: &[ObjField]) -> Result<Vec<Field>, GraphError> {
        fields
            .iter()
            .map(|field| {
                Ok(Field {
                    name: self.string(field.name)?,
                    ty: self.ty(field.ty)?,
                })
            })
            .collect()
    }

    fn obj(&self, obj: &ObjDef) -> Result<ObjType, GraphError> {
        let protos = obj
            .protos
            .iter()
            .map(|proto| {
                Ok(Proto {
                    name: self.string(proto.name)?,
                    function: self.function(proto.function)?,
                    pindex: proto.pindex,
                })
            })
            .collect::<Result<_, GraphError>>()?;
        let bindings = obj
            .bindings
            .iter()
            .map(|binding| {
                Ok(Binding {
                    field: binding.field,
                    function: self.function(binding.function)?,
                })
            })
            .collect::<Result<_, GraphError>>()?;

        Ok(ObjType {
            name: self.string(obj.name)?,
            super_type: obj.superclass().map(|index| self.ty(index)).transpose()?,
            global: self.global_slot(obj.global)?,
            fields: self.fields(&obj.fields)?,
            protos,
            bindings,
        })
    }

    fn type_node(&self, def: &TypeDef) -> Result<Type, GraphError> {
        Ok(match def {
            TypeDef::Void => Type::Void,
            TypeDef::U8 => Type::U8,
            TypeDef::U16 => Type::U16,
            TypeDef::I32 => Type::I32,
            TypeDef::I64 => Type::I64,
            TypeDef::F32 => Type::F32,
            TypeDef::F64 => Type::F64,
            TypeDef::Bool => Type::Bool,
            TypeDef::Bytes => Type::Bytes,
            TypeDef::Dyn => Type::Dyn,
            TypeDef::Array => Type::Array,
            TypeDef::Type => Type::Type,
            TypeDef::DynObj => Type::DynObj,
            TypeDef::Fun(sig) => Type::Fun(self.signature(sig)?),
            TypeDef::Method(sig) => Type::Method(self.signature(sig)?),
            TypeDef::Obj(obj) => Type::Obj(self.obj(obj)?),
            TypeDef::Struct(obj) => Type::Struct(self.obj(obj)?),
            TypeDef::Ref(inner) => Type::Ref(self.ty(*inner)?),
            TypeDef::Null(inner) => Type::Null(self.ty(*inner)?),
            TypeDef::Packed(inner) => Type::Packed(self.ty(*inner)?),
            TypeDef::Virtual(fields) => Type::Virtual(self.fields(fields)?),
            TypeDef::Abstract(name) => Type::Abstract(self.string(*name)?),
            TypeDef::Enum(def) => Type::Enum(EnumType {
                name: self.string(def.name)?,
                global: self.global_slot(def.global)?,
                constructs: def
                    .constructs
                    .iter()
                    .map(|construct| {
                        Ok(EnumConstruct {
                            name: self.string(construct.name)?,
                            params: self.types(&construct.params)?,
                        })
                    })
                    .collect::<Result<_, GraphError>>()?,
            }),
        })
    }

    fn function_header(&self, slot: Slot<'_>) -> Result<Function, GraphError> {
        Ok(match slot {
            Slot::Native(native) => Function {
                ty: self.ty(native.ty)?,
                body: FunctionBody::Native(Native {
                    lib: self.string(native.lib)?,
                    name: self.string(native.name)?,
                }),
            },
            Slot::Method(method) => Function {
                ty: self.ty(method.ty)?,
                body: FunctionBody::Method(Method {
                    name: None,
                    parent: None,
                    registers: self.types(&method.registers)?,
                    ops: Vec::new(),
                }),
            },
        })
    }

    fn constant(&self, constant: &module::Constant) -> Result<Constant, GraphError> {
        let &payload = constant.fields.first().ok_or(GraphError::InvalidConstant {
            global: constant.global,
        })?;
        Ok(Constant {
            global: self.global(constant.global)?,
            value: self.string(payload)?,
        })
    }
}

impl OperandSource for Resolver<'_> {
    fn int(&self, index: usize) -> Option<i32> {
        self.module.ints.get(index).copied()
    }

    fn float(&self, index: usize) -> Option<f64> {
        self.module.floats.get(index).copied()
    }

    fn string(&self, index: usize) -> Option<&str> {
        self.module.strings.get(index).map(String::as_str)
    }

    fn bytes(&self, index: usize) -> Option<&[u8]> {
        if self.module.has_bytes_pool() {
            self.module.bytes.get(index).map(Vec::as_slice)
        } else {
            self.module.strings.get(index).map(String::as_bytes)
        }
    }

    fn type_count(&self) -> usize {
        self.module.types.len()
    }

    fn function_count(&self) -> usize {
        self.module.function_count()
    }

    fn global_count(&self) -> usize {
        self.module.globals.len()
    }
}

fn missing(pool: &'static str, index: usize) -> GraphError {
    GraphError::Missing {
        pool,
        index: index as i64,
    }
}

/// Order natives and methods by function index
///
/// Fails unless the indices are exactly `0..natives + methods`.
fn function_slots(module: &Module) -> Result<Vec<Slot<'_>>, GraphError> {
    let count = module.function_count();
    let mut slots: Vec<Option<Slot<'_>>> = vec![None; count];

    let entries = module
        .natives
        .iter()
        .map(|n| (n.index, Slot::Native(n)))
        .chain(module.methods.iter().map(|m| (m.index, Slot::Method(m))));

    for (index, slot) in entries {
        match slots.get_mut(index) {
            Some(Some(_)) => return Err(GraphError::DuplicateFunction(index)),
            Some(entry) => *entry = Some(slot),
            None => return Err(GraphError::FunctionIndexGap { index, count }),
        }
    }

    // Every index is in range and unique, so every slot is filled
    Ok(slots.into_iter().flatten().collect())
}

impl Graph {
    /// Resolve a structural module into a graph
    pub fn build(module: &Module, strategy: ExecutionStrategy) -> Result<Self, GraphError> {
        let _span = info_span!("build_graph").entered();
        let start = Instant::now();
        let resolver = Resolver { module };

        let slots = function_slots(module)?;

        let types = strategy.try_map(&module.types, |i, def| {
            resolver.type_node(def).map_err(|e| e.at(format!("type {}", i)))
        })?;
        let globals = module
            .globals
            .iter()
            .enumerate()
            .map(|(i, &ty)| {
                resolver
                    .ty(ty)
                    .map(|ty| Global { ty })
                    .map_err(|e| e.at(format!("global {}", i)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let functions = strategy.try_map(&slots, |i, &slot| {
            resolver
                .function_header(slot)
                .map_err(|e| e.at(format!("function {}", i)))
        })?;
        let constants = module
            .constants
            .iter()
            .enumerate()
            .map(|(i, c)| resolver.constant(c).map_err(|e| e.at(format!("constant {}", i))))
            .collect::<Result<Vec<_>, _>>()?;
        let entrypoint = resolver
            .function(module.entrypoint)
            .map_err(|e| e.at("entry point"))?;

        let mut graph = Graph {
            version: module.version,
            types,
            functions,
            globals,
            constants,
            entrypoint,
        };
        graph.name_methods()?;

        let resolved = strategy.try_map(&slots, |i, slot| match slot {
            Slot::Method(method) => method
                .instructions
                .iter()
                .enumerate()
                .map(|(position, instruction)| {
                    Op::resolve(instruction, &resolver)
                        .map_err(|e| e.at(format!("function {} instruction {}", i, position)))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Slot::Native(_) => Ok(None),
        })?;
        for (i, (function, ops)) in graph.functions.iter_mut().zip(resolved).enumerate() {
            if let (Some(method), Some(ops)) = (function.as_method_mut(), ops) {
                debug!(function = i, ops = ops.len(), "resolved method");
                method.ops = ops;
            }
        }

        info!(
            types = graph.types.len(),
            functions = graph.functions.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "built graph"
        );
        Ok(graph)
    }

    /// Name methods after the protos and bindings that reference them
    fn name_methods(&mut self) -> Result<(), GraphError> {
        let mut protos = Vec::new();
        let mut bindings = Vec::new();

        for (i, ty) in self.types.iter().enumerate() {
            let Some(obj) = ty.as_obj() else {
                continue;
            };
            let owner = TypeId(i);

            for proto in &obj.protos {
                protos.push((proto.function, proto.name.clone(), owner));
            }
            if obj.bindings.is_empty() {
                continue;
            }

            let fields = self
                .all_fields(owner)
                .map_err(|e| e.at(format!("type {}", i)))?;
            for binding in &obj.bindings {
                let field = fields
                    .get(binding.field)
                    .ok_or_else(|| missing("field", binding.field).at(format!("type {}", i)))?;
                bindings.push((binding.function, field.name.clone(), owner));
            }
        }

        // Protos overwrite each other; a binding never overwrites a name
        for (id, name, owner) in protos {
            if let Some(method) = self.method_mut(id) {
                method.name = Some(name);
                method.parent = Some(owner);
            }
        }
        for (id, name, owner) in bindings {
            if let Some(method) = self.method_mut(id) {
                if method.name.is_some() {
                    return Err(GraphError::MultipleBindings { function: id.0 });
                }
                method.name = Some(name);
                method.parent = Some(owner);
            }
        }
        Ok(())
    }
}
