//! End-to-end pipeline tests: build typed ASTs the way the frontend
//! would, compile them, and check the emitted modules with the
//! ecosystem validator plus structural assertions.

use cotc::ast::*;
use cotc::diag::Span;
use cotc::ir::IrOp;
use cotc::types::{TypeIndex, TypeRegistry};
use cotc::{compile_module, CompileOptions};
use wasmparser::{ExternalKind, Parser, Payload};

fn sp() -> Span {
    Span::none()
}

fn expr(kind: ExprKind, ty: TypeIndex) -> Expr {
    Expr { kind, ty, span: sp() }
}

fn int(v: i64) -> Expr {
    expr(ExprKind::IntLit(v), TypeIndex::I64)
}

fn ident(name: &str, ty: TypeIndex) -> Expr {
    expr(ExprKind::Ident(name.to_string()), ty)
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr, ty: TypeIndex) -> Expr {
    expr(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        ty,
    )
}

fn stmt(kind: StmtKind) -> Stmt {
    Stmt { kind, span: sp() }
}

fn let_stmt(name: &str, ty: TypeIndex, init: Expr) -> Stmt {
    stmt(StmtKind::Let {
        name: name.to_string(),
        ty,
        init,
        weak: false,
    })
}

fn block(stmts: Vec<Stmt>) -> BlockStmt {
    BlockStmt { stmts }
}

fn main_fn(body: Vec<Stmt>) -> Decl {
    Decl::Fn(FnDecl {
        name: "main".to_string(),
        params: vec![],
        ret: TypeIndex::I64,
        body: block(body),
        span: sp(),
    })
}

fn module(decls: Vec<Decl>) -> Module {
    Module {
        name: "t".to_string(),
        decls,
    }
}

fn compile(m: &Module, types: &mut TypeRegistry, opts: &CompileOptions) -> Vec<u8> {
    compile_module(m, types, opts).expect("compilation succeeds")
}

fn validate(bytes: &[u8]) {
    wasmparser::validate(bytes).expect("emitted module validates");
}

fn exported_funcs(bytes: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    for payload in Parser::new(0).parse_all(bytes) {
        if let Payload::ExportSection(reader) = payload.unwrap() {
            for export in reader {
                let export = export.unwrap();
                if export.kind == ExternalKind::Func {
                    names.push(export.name.to_string());
                }
            }
        }
    }
    names
}

#[test]
fn scenario_return_42() {
    let m = module(vec![main_fn(vec![stmt(StmtKind::Return(Some(int(42))))])]);
    let mut types = TypeRegistry::new();
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
    assert_eq!(&bytes[..4], b"\0asm");
    assert!(exported_funcs(&bytes).contains(&"main".to_string()));
}

#[test]
fn scenario_if_arithmetic() {
    // let x = 10; let y = 5; if x + y != 15 { return 1 } return 0
    let cond = binary(
        BinOp::Ne,
        binary(
            BinOp::Add,
            ident("x", TypeIndex::I64),
            ident("y", TypeIndex::I64),
            TypeIndex::I64,
        ),
        int(15),
        TypeIndex::BOOL,
    );
    let m = module(vec![main_fn(vec![
        let_stmt("x", TypeIndex::I64, int(10)),
        let_stmt("y", TypeIndex::I64, int(5)),
        stmt(StmtKind::If {
            cond,
            then_body: block(vec![stmt(StmtKind::Return(Some(int(1))))]),
            else_body: None,
        }),
        stmt(StmtKind::Return(Some(int(0)))),
    ])]);
    let mut types = TypeRegistry::new();
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
}

#[test]
fn scenario_while_sum() {
    // sum = 0; i = 1; while i <= 10 { sum += i; i += 1 }
    // if sum != 55 { return 40 } return 0
    let m = module(vec![main_fn(vec![
        let_stmt("sum", TypeIndex::I64, int(0)),
        let_stmt("i", TypeIndex::I64, int(1)),
        stmt(StmtKind::While {
            label: None,
            cond: binary(BinOp::Le, ident("i", TypeIndex::I64), int(10), TypeIndex::BOOL),
            body: block(vec![
                stmt(StmtKind::Assign {
                    target: ident("sum", TypeIndex::I64),
                    value: binary(
                        BinOp::Add,
                        ident("sum", TypeIndex::I64),
                        ident("i", TypeIndex::I64),
                        TypeIndex::I64,
                    ),
                }),
                stmt(StmtKind::Assign {
                    target: ident("i", TypeIndex::I64),
                    value: binary(BinOp::Add, ident("i", TypeIndex::I64), int(1), TypeIndex::I64),
                }),
            ]),
        }),
        stmt(StmtKind::If {
            cond: binary(BinOp::Ne, ident("sum", TypeIndex::I64), int(55), TypeIndex::BOOL),
            then_body: block(vec![stmt(StmtKind::Return(Some(int(40))))]),
            else_body: None,
        }),
        stmt(StmtKind::Return(Some(int(0)))),
    ])]);
    let mut types = TypeRegistry::new();
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
}

/// Scenario 4: a destructor runs exactly once when the inner scope
/// exits. Structurally: the module carries a metadata record, a
/// destructor table entry, and a release call in main.
#[test]
fn scenario_arc_destructor_on_scope_exit() {
    let mut types = TypeRegistry::new();
    let tracer = types.make_struct("Tracer", vec![("id".to_string(), TypeIndex::I64)]);
    let tracer_ptr = types.make_pointer(tracer);

    let deinit = Decl::Fn(FnDecl {
        name: "Tracer_deinit".to_string(),
        params: vec![Param {
            name: "self".to_string(),
            ty: tracer_ptr,
            owned: false,
        }],
        ret: TypeIndex::VOID,
        body: block(vec![stmt(StmtKind::Assign {
            target: ident("global_counter", TypeIndex::I64),
            value: binary(
                BinOp::Add,
                ident("global_counter", TypeIndex::I64),
                int(1),
                TypeIndex::I64,
            ),
        })]),
        span: sp(),
    });
    let m = module(vec![
        Decl::Struct(StructDecl {
            name: "Tracer".to_string(),
            ty: tracer,
            span: sp(),
        }),
        Decl::GlobalVar(GlobalVarDecl {
            name: "global_counter".to_string(),
            ty: TypeIndex::I64,
            init: None,
            span: sp(),
        }),
        deinit,
        main_fn(vec![
            stmt(StmtKind::Block(block(vec![let_stmt(
                "t",
                tracer_ptr,
                expr(
                    ExprKind::New {
                        ty: tracer,
                        fields: vec![FieldInit {
                            name: "id".to_string(),
                            offset: 0,
                            value: int(7),
                        }],
                    },
                    tracer_ptr,
                ),
            )]))),
            stmt(StmtKind::Return(Some(ident("global_counter", TypeIndex::I64)))),
        ]),
    ]);
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);

    // The destructor table has index 0 reserved plus one entry.
    let mut table_min = 0;
    let mut has_element_section = false;
    for payload in Parser::new(0).parse_all(&bytes) {
        match payload.unwrap() {
            Payload::TableSection(reader) => {
                for t in reader {
                    table_min = t.unwrap().ty.initial;
                }
            }
            Payload::ElementSection(_) => has_element_section = true,
            _ => {}
        }
    }
    assert_eq!(table_min, 2, "null slot plus one destructor");
    assert!(has_element_section);
}

#[test]
fn scenario_string_concat_len() {
    // let a = "hello "; let b = "world"; let c = a ++ b; return @len(c)
    let m = module(vec![main_fn(vec![
        let_stmt(
            "a",
            TypeIndex::STRING,
            expr(ExprKind::StringLit("hello ".to_string()), TypeIndex::STRING),
        ),
        let_stmt(
            "b",
            TypeIndex::STRING,
            expr(ExprKind::StringLit("world".to_string()), TypeIndex::STRING),
        ),
        let_stmt(
            "c",
            TypeIndex::STRING,
            binary(
                BinOp::Concat,
                ident("a", TypeIndex::STRING),
                ident("b", TypeIndex::STRING),
                TypeIndex::STRING,
            ),
        ),
        stmt(StmtKind::Return(Some(expr(
            ExprKind::Builtin {
                name: "len".to_string(),
                args: vec![ident("c", TypeIndex::STRING)],
            },
            TypeIndex::I64,
        )))),
    ])]);
    let mut types = TypeRegistry::new();
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
    // Both literals land in the data segment.
    let mut found = false;
    for payload in Parser::new(0).parse_all(&bytes) {
        if let Payload::DataSection(reader) = payload.unwrap() {
            for seg in reader {
                let seg = seg.unwrap();
                let data = seg.data;
                found |= data
                    .windows(b"hello ".len())
                    .any(|w| w == b"hello ");
            }
        }
    }
    assert!(found, "string literal bytes present in the data segment");
}

fn assert_eq_call(a: Expr, b: Expr) -> Stmt {
    stmt(StmtKind::Expr(expr(
        ExprKind::Builtin {
            name: "assertEq".to_string(),
            args: vec![a, b],
        },
        TypeIndex::VOID,
    )))
}

/// Scenario 6: a test module with one passing and one failing test
/// exports both tests and main, imports the host writer, and validates.
#[test]
fn scenario_test_runner_module() {
    let m = module(vec![
        Decl::Test(TestDecl {
            name: "test_pass".to_string(),
            display_name: "passing".to_string(),
            body: block(vec![assert_eq_call(int(42), int(42))]),
            span: sp(),
        }),
        Decl::Test(TestDecl {
            name: "test_fail".to_string(),
            display_name: "failing".to_string(),
            body: block(vec![assert_eq_call(int(1), int(2))]),
            span: sp(),
        }),
    ]);
    let mut types = TypeRegistry::new();
    let opts = CompileOptions {
        test_mode: true,
        ..CompileOptions::default()
    };
    let bytes = compile(&m, &mut types, &opts);
    validate(&bytes);

    let exports = exported_funcs(&bytes);
    assert!(exports.contains(&"main".to_string()));
    assert!(exports.contains(&"test_pass".to_string()));
    assert!(exports.contains(&"test_fail".to_string()));

    let mut import_names = Vec::new();
    for payload in Parser::new(0).parse_all(&bytes) {
        if let Payload::ImportSection(reader) = payload.unwrap() {
            for imp in reader {
                import_names.push(imp.unwrap().name.to_string());
            }
        }
    }
    assert!(import_names.contains(&"cot_write".to_string()));
    assert!(import_names.contains(&"cot_time".to_string()));
}

#[test]
fn test_fail_fast_runner_compiles() {
    let m = module(vec![Decl::Test(TestDecl {
        name: "test_one".to_string(),
        display_name: "one".to_string(),
        body: block(vec![assert_eq_call(int(1), int(2))]),
        span: sp(),
    })]);
    let mut types = TypeRegistry::new();
    let opts = CompileOptions {
        test_mode: true,
        fail_fast: true,
        ..CompileOptions::default()
    };
    let bytes = compile(&m, &mut types, &opts);
    validate(&bytes);
}

/// The CLI flow on disk: the frontend serializes a `.cot.json` module,
/// the compiler reads it back, compiles, and writes the `.wasm` next to
/// it.
#[test]
fn test_module_file_round_trip_through_disk() {
    let m = module(vec![main_fn(vec![stmt(StmtKind::Return(Some(int(42))))])]);
    let file = ModuleFile {
        module: m,
        types: TypeRegistry::new(),
    };
    let dir = tempfile::tempdir().expect("temp dir");
    let in_path = dir.path().join("t.cot.json");
    std::fs::write(&in_path, serde_json::to_string(&file).unwrap()).unwrap();

    let text = std::fs::read_to_string(&in_path).unwrap();
    let mut back: ModuleFile = serde_json::from_str(&text).unwrap();
    back.types.rehydrate();
    let bytes = compile_module(&back.module, &mut back.types, &CompileOptions::default()).unwrap();

    let out_path = dir.path().join("t.wasm");
    std::fs::write(&out_path, &bytes).unwrap();
    let written = std::fs::read(&out_path).unwrap();
    assert_eq!(&written[..4], b"\0asm");
    validate(&written);
}

/// Growing a list through a struct-field receiver writes the
/// reallocated handle back through the field, not just bare locals.
#[test]
fn test_list_push_writes_handle_back_through_field() {
    let mut types = TypeRegistry::new();
    let list_ty = types.make_list(TypeIndex::I64);
    let holder = types.make_struct("Holder", vec![("items".to_string(), list_ty)]);
    let holder_ptr = types.make_pointer(holder);

    let field_recv = expr(
        ExprKind::Field {
            base: Box::new(ident("h", holder_ptr)),
            name: "items".to_string(),
            offset: 0,
        },
        list_ty,
    );
    let m = module(vec![
        Decl::Struct(StructDecl {
            name: "Holder".to_string(),
            ty: holder,
            span: sp(),
        }),
        Decl::Fn(FnDecl {
            name: "grow".to_string(),
            params: vec![Param {
                name: "h".to_string(),
                ty: holder_ptr,
                owned: false,
            }],
            ret: TypeIndex::VOID,
            body: block(vec![stmt(StmtKind::Expr(expr(
                ExprKind::MethodCall {
                    recv: Box::new(field_recv),
                    recv_type: "List".to_string(),
                    method: "push".to_string(),
                    args: vec![int(1)],
                },
                list_ty,
            )))]),
            span: sp(),
        }),
        main_fn(vec![stmt(StmtKind::Return(Some(int(0))))]),
    ]);

    let opts = CompileOptions::default();
    let ir = cotc::lower::Lowerer::new(&mut types, &opts).lower(&m).unwrap();
    let grow = ir.find_func("grow").unwrap();
    let push_pos = grow
        .nodes
        .iter()
        .position(|n| matches!(&n.op, IrOp::Call { name } if name == "cot_list_push"))
        .expect("push lowers to the runtime call");
    let store_after = grow.nodes[push_pos..]
        .iter()
        .any(|n| matches!(n.op, IrOp::PtrStore { .. }));
    assert!(
        store_after,
        "the returned handle must be stored back through the field"
    );

    let bytes = compile(&m, &mut types, &opts);
    validate(&bytes);
}

/// A function with no `new` and no imports emits zero retain/release
/// calls (checked at the IR level, where calls are still symbolic).
#[test]
fn law_no_arc_traffic_without_allocations() {
    let m = module(vec![main_fn(vec![
        let_stmt("x", TypeIndex::I64, int(1)),
        stmt(StmtKind::Return(Some(ident("x", TypeIndex::I64)))),
    ])]);
    let mut types = TypeRegistry::new();
    let opts = CompileOptions::default();
    let ir = cotc::lower::Lowerer::new(&mut types, &opts)
        .lower(&m)
        .unwrap();
    for f in &ir.funcs {
        for node in &f.nodes {
            if let IrOp::Call { name } = &node.op {
                assert!(
                    name != "cot_retain" && name != "cot_release",
                    "unexpected ARC call in allocation-free code"
                );
            }
        }
    }
}

/// Switch over a union matches a zero-payload variant by its
/// unqualified name and binds payloads on capturing arms.
#[test]
fn test_union_switch_compiles() {
    let mut types = TypeRegistry::new();
    let shape = types.make_union(
        "Shape",
        TypeIndex::I64,
        vec![
            cotc::types::Variant {
                name: "Circle".to_string(),
                payload: Some(TypeIndex::I64),
            },
            cotc::types::Variant {
                name: "Empty".to_string(),
                payload: None,
            },
        ],
    );
    let m = module(vec![main_fn(vec![
        let_stmt(
            "s",
            shape,
            expr(
                ExprKind::UnionLit {
                    ty: shape,
                    variant: "Circle".to_string(),
                    payload: Some(Box::new(int(9))),
                },
                shape,
            ),
        ),
        stmt(StmtKind::Switch {
            scrutinee: ident("s", shape),
            arms: vec![
                SwitchArm {
                    pattern: Pattern::UnionVariant {
                        name: "Circle".to_string(),
                    },
                    binding: Some("r".to_string()),
                    body: block(vec![stmt(StmtKind::Return(Some(ident(
                        "r",
                        TypeIndex::I64,
                    ))))]),
                    span: sp(),
                },
                SwitchArm {
                    pattern: Pattern::UnionVariant {
                        name: "Empty".to_string(),
                    },
                    binding: None,
                    body: block(vec![stmt(StmtKind::Return(Some(int(0))))]),
                    span: sp(),
                },
            ],
        }),
        stmt(StmtKind::Return(Some(int(0)))),
    ])]);
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
}

/// try/catch over an error union: the error arm propagates and the
/// catch arm handles.
#[test]
fn test_error_union_try_compiles() {
    let mut types = TypeRegistry::new();
    let eu = types.make_error_union(TypeIndex::I64);

    let fallible = Decl::Fn(FnDecl {
        name: "may_fail".to_string(),
        params: vec![Param {
            name: "fail".to_string(),
            ty: TypeIndex::BOOL,
            owned: false,
        }],
        ret: eu,
        body: block(vec![
            stmt(StmtKind::If {
                cond: ident("fail", TypeIndex::BOOL),
                then_body: block(vec![stmt(StmtKind::Return(Some(expr(
                    ExprKind::ErrorValue {
                        set: "IoError".to_string(),
                        name: "NotFound".to_string(),
                        tag: 3,
                    },
                    eu,
                ))))]),
                else_body: None,
            }),
            stmt(StmtKind::Return(Some(int(7)))),
        ]),
        span: sp(),
    });
    let caller = Decl::Fn(FnDecl {
        name: "caller".to_string(),
        params: vec![],
        ret: eu,
        body: block(vec![
            let_stmt(
                "v",
                TypeIndex::I64,
                expr(
                    ExprKind::Try(Box::new(expr(
                        ExprKind::Call {
                            name: "may_fail".to_string(),
                            args: vec![expr(ExprKind::BoolLit(false), TypeIndex::BOOL)],
                            instance: None,
                        },
                        eu,
                    ))),
                    TypeIndex::I64,
                ),
            ),
            stmt(StmtKind::Return(Some(ident("v", TypeIndex::I64)))),
        ]),
        span: sp(),
    });
    let m = module(vec![
        fallible,
        caller,
        main_fn(vec![
            let_stmt(
                "r",
                TypeIndex::I64,
                expr(
                    ExprKind::Catch {
                        expr: Box::new(expr(
                            ExprKind::Call {
                                name: "caller".to_string(),
                                args: vec![],
                                instance: None,
                            },
                            eu,
                        )),
                        binding: Some("e".to_string()),
                        handler: block(vec![stmt(StmtKind::Return(Some(int(1))))]),
                    },
                    TypeIndex::I64,
                ),
            ),
            stmt(StmtKind::Return(Some(ident("r", TypeIndex::I64)))),
        ]),
    ]);
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
}

/// @assertEq over sub-64-bit operands widens both sides; the emitted
/// module must still validate with the extra extends in place.
#[test]
fn test_assert_eq_small_types_widen() {
    let mut types = TypeRegistry::new();
    let m = module(vec![Decl::Test(TestDecl {
        name: "test_small".to_string(),
        display_name: "small".to_string(),
        body: block(vec![assert_eq_call(
            expr(ExprKind::IntLit(200), TypeIndex::U8),
            expr(ExprKind::IntLit(200), TypeIndex::U8),
        )]),
        span: sp(),
    })]);
    let opts = CompileOptions {
        test_mode: true,
        ..CompileOptions::default()
    };
    let bytes = compile(&m, &mut types, &opts);
    validate(&bytes);
}

/// For-loops over strings desugar to an index-increment loop.
#[test]
fn test_for_over_string_compiles() {
    let m = module(vec![main_fn(vec![
        let_stmt(
            "s",
            TypeIndex::STRING,
            expr(ExprKind::StringLit("abc".to_string()), TypeIndex::STRING),
        ),
        let_stmt("n", TypeIndex::I64, int(0)),
        stmt(StmtKind::For {
            label: None,
            binding: "ch".to_string(),
            iterable: ident("s", TypeIndex::STRING),
            body: block(vec![stmt(StmtKind::Assign {
                target: ident("n", TypeIndex::I64),
                value: binary(BinOp::Add, ident("n", TypeIndex::I64), int(1), TypeIndex::I64),
            })]),
        }),
        stmt(StmtKind::Return(Some(ident("n", TypeIndex::I64)))),
    ])]);
    let mut types = TypeRegistry::new();
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
}

/// Logical operators short-circuit through branches, not a binary op.
#[test]
fn test_short_circuit_logic_compiles() {
    let cond = expr(
        ExprKind::Logical {
            and: true,
            lhs: Box::new(binary(BinOp::Gt, ident("x", TypeIndex::I64), int(0), TypeIndex::BOOL)),
            rhs: Box::new(binary(
                BinOp::Lt,
                ident("x", TypeIndex::I64),
                int(100),
                TypeIndex::BOOL,
            )),
        },
        TypeIndex::BOOL,
    );
    let m = module(vec![main_fn(vec![
        let_stmt("x", TypeIndex::I64, int(50)),
        stmt(StmtKind::If {
            cond,
            then_body: block(vec![stmt(StmtKind::Return(Some(int(0))))]),
            else_body: None,
        }),
        stmt(StmtKind::Return(Some(int(1)))),
    ])]);
    let mut types = TypeRegistry::new();
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
}

/// Defers run on scope exit; a defer inside a loop body with break and
/// continue still produces a valid module.
#[test]
fn test_defer_with_loop_exits_compiles() {
    let m = module(vec![
        Decl::GlobalVar(GlobalVarDecl {
            name: "g".to_string(),
            ty: TypeIndex::I64,
            init: None,
            span: sp(),
        }),
        main_fn(vec![
            let_stmt("i", TypeIndex::I64, int(0)),
            stmt(StmtKind::While {
                label: None,
                cond: binary(BinOp::Lt, ident("i", TypeIndex::I64), int(10), TypeIndex::BOOL),
                body: block(vec![
                    stmt(StmtKind::Defer(block(vec![stmt(StmtKind::Assign {
                        target: ident("g", TypeIndex::I64),
                        value: binary(
                            BinOp::Add,
                            ident("g", TypeIndex::I64),
                            int(1),
                            TypeIndex::I64,
                        ),
                    })]))),
                    stmt(StmtKind::Assign {
                        target: ident("i", TypeIndex::I64),
                        value: binary(BinOp::Add, ident("i", TypeIndex::I64), int(1), TypeIndex::I64),
                    }),
                    stmt(StmtKind::If {
                        cond: binary(BinOp::Eq, ident("i", TypeIndex::I64), int(5), TypeIndex::BOOL),
                        then_body: block(vec![stmt(StmtKind::Break { label: None })]),
                        else_body: None,
                    }),
                    stmt(StmtKind::If {
                        cond: binary(BinOp::Eq, ident("i", TypeIndex::I64), int(3), TypeIndex::BOOL),
                        then_body: block(vec![stmt(StmtKind::Continue { label: None })]),
                        else_body: None,
                    }),
                ]),
            }),
            stmt(StmtKind::Return(Some(ident("g", TypeIndex::I64)))),
        ]),
    ]);
    let mut types = TypeRegistry::new();
    let bytes = compile(&m, &mut types, &CompileOptions::default());
    validate(&bytes);
}
