//! Shared fixtures for integration tests

#![allow(dead_code)]

use hlpatch_bytecode::debug::DebugPosition;
use hlpatch_bytecode::module::{Constant, Method, Native, VarAssign};
use hlpatch_bytecode::types::{FunSignature, ObjDef, ObjField, ObjProto, TypeDef};
use hlpatch_bytecode::{Instruction, Module, Opcode};

/// Programmatic module builder
///
/// Natives and methods share one function index space; each call to
/// [`ModuleBuilder::native`] or [`ModuleBuilder::method`] takes the next
/// free index.
pub struct ModuleBuilder {
    module: Module,
    next_function: usize,
    debug: bool,
}

impl ModuleBuilder {
    pub fn new(version: u8) -> Self {
        Self {
            module: Module::new(version),
            next_function: 0,
            debug: false,
        }
    }

    /// Emit debug tables: one source file, line `10 * (i + 1)` for
    /// instruction `i`
    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn string(&mut self, value: &str) -> usize {
        if let Some(index) = self.module.strings.iter().position(|s| s == value) {
            return index;
        }
        self.module.strings.push(value.to_string());
        self.module.strings.len() - 1
    }

    /// Always appends, so duplicate values get distinct entries
    pub fn int(&mut self, value: i32) -> i32 {
        self.module.ints.push(value);
        (self.module.ints.len() - 1) as i32
    }

    pub fn float(&mut self, value: f64) -> i32 {
        self.module.floats.push(value);
        (self.module.floats.len() - 1) as i32
    }

    pub fn ty(&mut self, ty: TypeDef) -> usize {
        self.module.types.push(ty);
        self.module.types.len() - 1
    }

    pub fn global(&mut self, ty: usize) -> usize {
        self.module.globals.push(ty);
        self.module.globals.len() - 1
    }

    pub fn native(&mut self, lib: &str, name: &str, ty: usize) -> usize {
        let index = self.next_index();
        let lib = self.string(lib);
        let name = self.string(name);
        self.module.natives.push(Native {
            lib,
            name,
            ty,
            index,
        });
        index
    }

    pub fn method(&mut self, ty: usize, registers: Vec<usize>, instructions: Vec<Instruction>) -> usize {
        let index = self.next_index();
        self.module.methods.push(Method {
            ty,
            index,
            registers,
            instructions,
            debug: None,
            assigns: None,
        });
        index
    }

    pub fn string_constant(&mut self, global: usize, value: &str) {
        let payload = self.string(value);
        self.module.constants.push(Constant {
            global,
            fields: vec![payload, value.len()],
        });
    }

    pub fn entrypoint(&mut self, index: usize) {
        self.module.entrypoint = index;
    }

    pub fn build(mut self) -> Module {
        if self.debug {
            self.module.has_debug = true;
            self.module.debug_files = vec!["src/Main.hx".to_string()];
            let first_var = self.string("this");
            for method in &mut self.module.methods {
                method.debug = Some(
                    (0..method.instructions.len())
                        .map(|i| DebugPosition::new(0, 10 * (i as i32 + 1)))
                        .collect(),
                );
                method.assigns = Some(vec![VarAssign {
                    name: first_var,
                    position: 0,
                }]);
            }
        }
        self.module
    }

    fn next_index(&mut self) -> usize {
        let index = self.next_function;
        self.next_function += 1;
        index
    }
}

pub fn ins(opcode: Opcode, args: &[i32]) -> Instruction {
    Instruction::new(opcode, args.to_vec())
}

/// A small program: three natives and two methods interleaved in the
/// function index space, an object type with a proto, a string constant
///
/// Function indices: 0 `std.log`, 1 `main`, 2 `std.sys_time`,
/// 3 `Point.length`, 4 `std.math_sqrt`.
pub fn sample(version: u8, debug: bool) -> Module {
    let mut b = ModuleBuilder::new(version);
    if debug {
        b = b.with_debug();
    }

    let void = b.ty(TypeDef::Void);
    let i32_ty = b.ty(TypeDef::I32);
    let f64_ty = b.ty(TypeDef::F64);
    let unit_fn = b.ty(TypeDef::Fun(FunSignature {
        args: vec![],
        ret: void,
    }));
    let int_fn = b.ty(TypeDef::Fun(FunSignature {
        args: vec![i32_ty],
        ret: i32_ty,
    }));
    let bytes_ty = b.ty(TypeDef::Bytes);

    let point_name = b.string("Point");
    let x = b.string("x");
    let y = b.string("y");
    let length = b.string("length");
    let point = b.ty(TypeDef::Obj(ObjDef {
        name: point_name,
        super_type: -1,
        global: 1,
        fields: vec![ObjField { name: x, ty: i32_ty }, ObjField { name: y, ty: i32_ty }],
        protos: vec![ObjProto {
            name: length,
            function: 3,
            pindex: -1,
        }],
        bindings: vec![],
    }));

    b.global(point);
    let greeting = b.global(bytes_ty);

    let forty_two = b.int(42);
    let _unused = b.int(7);
    let forty_two_again = b.int(42);
    let half = b.float(1.5);

    let log = b.native("std", "log", int_fn) as i32;
    let main = b.method(
        unit_fn,
        vec![i32_ty, i32_ty, point, f64_ty, void],
        vec![
            ins(Opcode::Int, &[0, forty_two]),
            ins(Opcode::Int, &[1, forty_two_again]),
            ins(Opcode::Field, &[1, 2, 0]),
            ins(Opcode::Add, &[0, 0, 1]),
            ins(Opcode::Float, &[3, half]),
            ins(Opcode::Call1, &[4, log, 0]),
            ins(Opcode::JAlways, &[0]),
            ins(Opcode::Ret, &[4]),
        ],
    );
    b.native("std", "sys_time", unit_fn);
    b.method(
        int_fn,
        vec![i32_ty, i32_ty],
        vec![
            ins(Opcode::Int, &[1, forty_two]),
            ins(Opcode::Mul, &[0, 0, 1]),
            ins(Opcode::Ret, &[0]),
        ],
    );
    b.native("std", "math_sqrt", int_fn);

    b.string_constant(greeting, "hello");
    b.entrypoint(main);
    b.build()
}

/// One method returning register 0, no debug tables, no constants
pub fn minimal(version: u8) -> Module {
    let mut b = ModuleBuilder::new(version);
    let void = b.ty(TypeDef::Void);
    let unit_fn = b.ty(TypeDef::Fun(FunSignature {
        args: vec![],
        ret: void,
    }));
    let main = b.method(unit_fn, vec![void], vec![ins(Opcode::Ret, &[0])]);
    b.entrypoint(main);
    b.build()
}
