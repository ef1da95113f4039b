//! Kum compiler mid-end.
//!
//! Lowers programs in a small procedural language with Russian keywords
//! (`алг`, `нач`, `кон`, `нц`, `кц`, ...) from a parsed AST down to a
//! three-address, block-structured IR ready for a bytecode interpreter or
//! a native code generator.
//!
//! # Pipeline
//!
//! 1. **Transforms + resolution** ([`transform::pipeline`]): reserved
//!    identifiers and `assert` desugar, names resolve to symbols with
//!    lexical scoping, array declarations expand their hidden bound/stride
//!    variables, and the type annotator and the type-dependent rewrites run
//!    to a bounded fixpoint.
//! 2. **Lowering** ([`lower::Lowerer`]): the annotated AST becomes an IR
//!    [`ir::Module`] with typed temporaries, local slots and module slots,
//!    explicit string retain/release calls, and synthetic module
//!    constructor/destructor functions for globals.
//! 3. **Optimization** ([`passes::optimize`]): SSA construction (Braun et
//!    al.), constant folding, register renumbering and cleanup.
//! 4. Before code generation, [`passes::prepare_codegen`] leaves SSA by
//!    splitting critical edges and emitting parallel copies.
//!
//! The lexer/parser and the backends are external collaborators: the
//! parser feeds the [`ast::Ast`] construction API, and backends consume
//! the finalized [`ir::Module`].
//!
//! # Extending the Compiler
//!
//! Runtime modules beyond the builtin `system` and `runtime` can be
//! registered through [`CompilerConfig`], either in code or from a TOML
//! manifest; programs pull them in with a leading `use` directive.

pub mod annotate;
pub mod ast;
pub mod config;
pub mod error;
pub mod ir;
pub mod lower;
pub mod modules;
pub mod op;
pub mod passes;
pub mod resolver;
pub mod transform;
pub mod types;

pub use ast::{Ast, NodeId};
pub use config::{CompilerConfig, OptimizationLevel};
pub use error::{Error, ErrorKind, SourceLoc};
pub use ir::{Builder, Module};
pub use lower::Lowerer;
pub use passes::prepare_codegen;
pub use resolver::Resolver;
pub use types::Type;

use modules::{RUNTIME_MODULE, SYSTEM_MODULE};

/// Compile a parsed program into a finalized IR module.
///
/// The builtin `system` and `runtime` modules are always available;
/// modules from `config` become importable through `use` directives.
pub fn compile(ast: &mut Ast, root: NodeId, config: &CompilerConfig) -> Result<Module, Error> {
    let mut resolver = Resolver::new();
    resolver.register_module(modules::system_module());
    resolver.register_module(modules::runtime_module());
    for module in config.modules() {
        resolver.register_module(module.clone());
    }
    resolver.import_module(ast, SYSTEM_MODULE);
    resolver.import_module(ast, RUNTIME_MODULE);

    let mut root = root;
    transform::pipeline(ast, &mut root, &mut resolver)?;

    let mut builder = Builder::default();
    Lowerer::new(ast, &resolver, &mut builder).lower_top(root)?;
    let mut module = builder.finish();

    if config.opt_level != OptimizationLevel::None {
        passes::optimize(&mut module)?;
    }
    tracing::debug!(functions = module.functions.len(), "compilation finished");
    Ok(module)
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::ir::{Function, Label, Operand, Tmp};
    use crate::op;
    use crate::types::Type;

    /// `цел ф; ф := 0; нц пока ф < 10; ф := ф + 1; кц` inside a parameterless
    /// function.
    fn while_counter_program(ast: &mut Ast) -> NodeId {
        let l = loc();
        let d = ast.var_decl(l, "ф", Type::int());
        let zero = ast.int(l, 0);
        let init = ast.assign(l, "ф", zero);
        let use1 = ast.ident(l, "ф");
        let ten = ast.int(l, 10);
        let cond = ast.binary(l, op::LT, use1, ten);
        let use2 = ast.ident(l, "ф");
        let one = ast.int(l, 1);
        let inc = ast.binary(l, op::ADD, use2, one);
        let step = ast.assign(l, "ф", inc);
        let body = ast.block(l, vec![step]);
        let while_loop = ast.while_loop(l, cond, body);
        let fun_body = ast.block(l, vec![d, init, while_loop]);
        let f = ast.fun_decl(l, "главная", vec![], fun_body, Type::void());
        ast.block(l, vec![f])
    }

    /// `алг цел факториал(цел число)` with a counted loop over `i`.
    fn factorial_program(ast: &mut Ast) -> NodeId {
        let l = loc();
        let param = ast.var_decl(l, "число", Type::int());
        let di = ast.var_decl(l, "i", Type::int());
        let one = ast.int(l, 1);
        let init_ret = ast.assign(l, "$$return", one);
        let one2 = ast.int(l, 1);
        let init_i = ast.assign(l, "i", one2);
        let use_i = ast.ident(l, "i");
        let use_n = ast.ident(l, "число");
        let cond = ast.binary(l, op::LE, use_i, use_n);
        let pre = ast.block(l, vec![]);
        let ret1 = ast.ident(l, "$$return");
        let use_i2 = ast.ident(l, "i");
        let mul = ast.binary(l, op::MUL, ret1, use_i2);
        let acc = ast.assign(l, "$$return", mul);
        let body = ast.block(l, vec![acc]);
        let use_i3 = ast.ident(l, "i");
        let one3 = ast.int(l, 1);
        let inc = ast.binary(l, op::ADD, use_i3, one3);
        let step = ast.assign(l, "i", inc);
        let post = ast.block(l, vec![step]);
        let for_loop = ast.for_loop(l, cond, pre, body, post);
        let fun_body = ast.block(l, vec![di, init_ret, init_i, for_loop]);
        let f = ast.fun_decl(l, "факториал", vec![param], fun_body, Type::int());
        ast.block(l, vec![f])
    }

    // A while loop produces the five-block shape with the end block
    // materialized last.
    #[test]
    fn while_loop_cfg_shape() {
        let mut module = compile_unoptimized(while_counter_program);
        assert_eq!(module.functions.len(), 1);
        let f = &mut module.functions[0];
        passes::build_cfg(f).unwrap();

        assert_eq!(f.blocks.len(), 5);
        let succ_sizes: Vec<usize> = f.blocks.iter().map(|b| b.succ.len()).collect();
        assert_eq!(succ_sizes, vec![1, 2, 1, 1, 0]);
        let pred_sizes: Vec<usize> = f.blocks.iter().map(|b| b.pred.len()).collect();
        assert_eq!(pred_sizes, vec![0, 2, 1, 1, 1]);

        let labels: Vec<Label> = f.blocks.iter().map(|b| b.label).collect();
        assert_eq!(f.blocks[0].succ, vec![labels[1]]);
        assert_eq!(f.blocks[1].succ, vec![labels[2], labels[3]]);
        assert_eq!(f.blocks[2].succ, vec![labels[1]]);

        let rpo = passes::compute_rpo(f).unwrap();
        assert_eq!(
            rpo,
            vec![Label(0), Label(2), Label(4), Label(1), Label(3)]
        );
    }

    // After SSA promotion, folding and renumbering, factorial keeps no
    // memory traffic on its locals.
    #[test]
    fn factorial_promotes_locals_fully() {
        let module = compile_program(factorial_program);
        let f = module
            .function_by_name("факториал")
            .expect("factorial function");

        // No stores remain; the only loads read the parameter.
        for block in &f.blocks {
            for instr in &block.instrs {
                assert_ne!(instr.op, op::STRE, "store survived SSA promotion");
                if instr.op == op::LOAD {
                    match instr.operands[0] {
                        Operand::Local(l) => {
                            assert!(f.is_param(l), "non-parameter local load survived")
                        }
                        _ => panic!("unexpected load operand"),
                    }
                }
            }
        }

        // The multiplication reads its accumulator from a two-input phi.
        let phi_dests: Vec<Tmp> = f
            .blocks
            .iter()
            .flat_map(|b| &b.phis)
            .filter(|p| p.incoming().count() == 2)
            .filter_map(|p| p.dest)
            .collect();
        assert!(!phi_dests.is_empty());
        let mul_reads_phi = f.blocks.iter().flat_map(|b| &b.instrs).any(|i| {
            i.op == op::MUL
                && i.operands
                    .iter()
                    .any(|o| o.as_tmp().is_some_and(|t| phi_dests.contains(&t)))
        });
        assert!(mul_reads_phi, "multiplication does not read a loop phi");
    }

    // Temporaries are dense after renumbering.
    #[test]
    fn factorial_tmps_are_dense() {
        let module = compile_program(factorial_program);
        let f = module.function_by_name("факториал").unwrap();
        let mut seen = std::collections::HashSet::new();
        for block in &f.blocks {
            for phi in &block.phis {
                seen.extend(phi.dest.map(|t| t.0));
                seen.extend(phi.operands.iter().filter_map(|o| o.as_tmp()).map(|t| t.0));
            }
            for instr in &block.instrs {
                seen.extend(instr.dest.map(|t| t.0));
                seen.extend(instr.operands.iter().filter_map(|o| o.as_tmp()).map(|t| t.0));
            }
        }
        let max = seen.iter().copied().max().unwrap_or(0);
        assert_eq!(seen.len() as u32, max + 1, "temporary numbering has holes");
    }

    // Short-circuit AND lowers to a diamond with a two-input phi whose
    // incoming labels are the real producing blocks.
    #[test]
    fn short_circuit_and_builds_phi() {
        let module = compile_unoptimized(|ast| {
            let l = loc();
            let pa = ast.var_decl(l, "a", Type::boolean());
            let pb = ast.var_decl(l, "b", Type::boolean());
            let dr = ast.var_decl(l, "r", Type::boolean());
            let ua = ast.ident(l, "a");
            let ub = ast.ident(l, "b");
            let and = ast.binary(l, op::AND, ua, ub);
            let asg = ast.assign(l, "r", and);
            let body = ast.block(l, vec![dr, asg]);
            let f = ast.fun_decl(l, "ф", vec![pa, pb], body, Type::void());
            ast.block(l, vec![f])
        });
        let f = module.function_by_name("ф").unwrap();

        let (merge_idx, phi) = f
            .blocks
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.phis.first().map(|p| (i, p.clone())))
            .expect("merge block with phi");
        let incoming: Vec<(Operand, Label)> = phi.incoming().collect();
        assert_eq!(incoming.len(), 2);
        let merge_label = f.blocks[merge_idx].label;

        // First edge: the predicate block, terminated by the cmp.
        let pred_idx = f.block_index(incoming[0].1).unwrap();
        let cmp = f.blocks[pred_idx].instrs.last().unwrap();
        assert_eq!(cmp.op, op::CMP);
        assert_eq!(cmp.operands[2].as_label(), Some(merge_label));

        // Second edge: the RHS block, falling through to the merge.
        let rhs_idx = f.block_index(incoming[1].1).unwrap();
        let jmp = f.blocks[rhs_idx].instrs.last().unwrap();
        assert_eq!(jmp.op, op::JMP);
        assert_eq!(jmp.operands[0].as_label(), Some(merge_label));
    }

    fn concat_program(ast: &mut Ast) -> NodeId {
        let l = loc();
        let ds = ast.var_decl(l, "s", Type::string());
        let a = ast.string_lit(l, "a");
        let b = ast.string_lit(l, "b");
        let sum = ast.binary(l, op::ADD, a, b);
        let asg = ast.assign(l, "s", sum);
        let body = ast.block(l, vec![ds, asg]);
        let f = ast.fun_decl(l, "ф", vec![], body, Type::void());
        ast.block(l, vec![f])
    }

    // String concatenation materializes both literals, releases them
    // after the call (last first), releases the previous value of the
    // destination, and releases the local at scope exit.
    #[test]
    fn string_concat_reference_counts_balance() {
        let module = compile_unoptimized(concat_program);
        let f = module.function_by_name("ф").unwrap();
        let names = called_names(&module, f);
        assert_eq!(
            names,
            vec![
                "str_from_lit",
                "str_from_lit",
                "str_concat",
                "str_release",
                "str_release",
                "str_release",
                "str_release",
            ]
        );
        assert_eq!(module.string_literals, vec!["a", "b"]);
    }

    // The optimized form drops exactly the null release of the never-written
    // previous value.
    #[test]
    fn null_release_is_stripped_after_ssa() {
        let module = compile_program(concat_program);
        let f = module.function_by_name("ф").unwrap();
        let releases = called_names(&module, f)
            .into_iter()
            .filter(|n| n == "str_release")
            .count();
        assert_eq!(releases, 3);
    }

    // An array declaration creates the array from the hidden stride
    // variable and registers a scope-exit destroy.
    #[test]
    fn array_declaration_creates_and_destroys() {
        let module = compile_unoptimized(|ast| {
            let l = loc();
            let lo0 = ast.int(l, 1);
            let hi0 = ast.int(l, 3);
            let lo1 = ast.int(l, 1);
            let hi1 = ast.int(l, 4);
            let decl = ast.var_decl_bounded(
                l,
                "a",
                Type::array(Type::int(), 2),
                vec![(lo0, hi0), (lo1, hi1)],
            );
            let body = ast.block(l, vec![decl]);
            let f = ast.fun_decl(l, "ф", vec![], body, Type::void());
            ast.block(l, vec![f])
        });
        let f = module.function_by_name("ф").unwrap();
        let names = called_names(&module, f);
        assert!(names.contains(&"array_create".to_string()));
        assert!(names.contains(&"array_destroy".to_string()));
        // Two dimensions produce six hidden locals.
        assert!(f.local_types.len() >= 6);
    }

    fn continue_program(ast: &mut Ast) -> NodeId {
        let l = loc();
        let di = ast.var_decl(l, "i", Type::int());
        let ds = ast.var_decl(l, "s", Type::int());
        let zero = ast.int(l, 0);
        let init_i = ast.assign(l, "i", zero);
        let zero2 = ast.int(l, 0);
        let init_s = ast.assign(l, "s", zero2);

        let use_i = ast.ident(l, "i");
        let four = ast.int(l, 4);
        let while_cond = ast.binary(l, op::LT, use_i, four);

        let use_i2 = ast.ident(l, "i");
        let two = ast.int(l, 2);
        let mod_call = ast.call_named(l, "mod", vec![use_i2, two]);
        let zero3 = ast.int(l, 0);
        let if_cond = ast.binary(l, op::EQ, mod_call, zero3);
        let use_i3 = ast.ident(l, "i");
        let one = ast.int(l, 1);
        let inc1 = ast.binary(l, op::ADD, use_i3, one);
        let step1 = ast.assign(l, "i", inc1);
        let cont = ast.continue_stmt(l);
        let then = ast.block(l, vec![step1, cont]);
        let iff = ast.if_stmt(l, if_cond, then, None);

        let use_s = ast.ident(l, "s");
        let use_i4 = ast.ident(l, "i");
        let add = ast.binary(l, op::ADD, use_s, use_i4);
        let acc = ast.assign(l, "s", add);
        let use_i5 = ast.ident(l, "i");
        let one2 = ast.int(l, 1);
        let inc2 = ast.binary(l, op::ADD, use_i5, one2);
        let step2 = ast.assign(l, "i", inc2);

        let body = ast.block(l, vec![iff, acc, step2]);
        let while_loop = ast.while_loop(l, while_cond, body);
        let fun_body = ast.block(l, vec![di, ds, init_i, init_s, while_loop]);
        let f = ast.fun_decl(l, "ф", vec![], fun_body, Type::void());
        ast.block(l, vec![f])
    }

    // The continue edge targets the loop condition directly, and
    // trivial-phi elimination leaves only genuine merges.
    #[test]
    fn continue_targets_loop_condition() {
        let mut module = compile_program(continue_program);
        let f = &mut module.functions[0];
        passes::build_cfg(f).unwrap();

        // The loop condition block is the entry block's jump target; it
        // merges the entry edge, the body tail, and the continue edge.
        let cond_label = f.blocks[0].instrs.last().unwrap().operands[0]
            .as_label()
            .unwrap();
        let cond_idx = f.block_index(cond_label).unwrap();
        assert_eq!(f.blocks[cond_idx].pred.len(), 3);

        // Every surviving phi merges at least two distinct values.
        for block in &f.blocks {
            for phi in &block.phis {
                let values: std::collections::HashSet<String> = phi
                    .incoming()
                    .map(|(v, _)| format!("{:?}", v))
                    .collect();
                assert!(values.len() >= 2, "trivial phi survived elimination");
            }
        }
    }

    // No critical edges survive de-SSA.
    #[test]
    fn de_ssa_splits_critical_edges() {
        let mut module = compile_program(continue_program);
        passes::prepare_codegen(&mut module).unwrap();
        for f in &mut module.functions {
            passes::build_cfg(f).unwrap();
            assert!(f.blocks.iter().all(|b| b.phis.is_empty()));
            for block in &f.blocks {
                if block.succ.len() <= 1 {
                    continue;
                }
                for succ in &block.succ {
                    let si = f.block_index(*succ).unwrap();
                    assert!(
                        f.blocks[si].pred.len() <= 1,
                        "critical edge {} -> {} survived",
                        block.label.0,
                        succ.0
                    );
                }
            }
        }
    }

    // Swap-like phi transfers round-trip through the parallel copies.
    #[test]
    fn de_ssa_preserves_parallel_copy_semantics() {
        use crate::ir::{Block, Imm, Instr, Phi};
        let mut f = Function {
            name: "swap".to_string(),
            ..Function::default()
        };
        let l0 = f.fresh_label();
        let l1 = f.fresh_label();
        let l2 = f.fresh_label();
        let t0 = f.fresh_tmp();
        let t1 = f.fresh_tmp();
        let x = f.fresh_tmp();
        let y = f.fresh_tmp();

        let mut entry = Block::new(l0);
        entry.instrs = vec![
            Instr::new(op::MOV, Some(t0), vec![Operand::Imm(Imm::raw(1))]),
            Instr::new(op::MOV, Some(t1), vec![Operand::Imm(Imm::raw(2))]),
            Instr::new(op::JMP, None, vec![Operand::Label(l1)]),
        ];
        let mut header = Block::new(l1);
        header.phis = vec![
            Phi {
                op: op::PHI,
                dest: Some(x),
                operands: vec![
                    Operand::Tmp(t0),
                    Operand::Label(l0),
                    Operand::Tmp(y),
                    Operand::Label(l1),
                ],
            },
            Phi {
                op: op::PHI,
                dest: Some(y),
                operands: vec![
                    Operand::Tmp(t1),
                    Operand::Label(l0),
                    Operand::Tmp(x),
                    Operand::Label(l1),
                ],
            },
        ];
        header.instrs = vec![Instr::new(
            op::CMP,
            None,
            vec![
                Operand::Imm(Imm::raw(1)),
                Operand::Label(l1),
                Operand::Label(l2),
            ],
        )];
        let mut exit = Block::new(l2);
        exit.instrs = vec![Instr::new(op::RET, None, vec![])];
        f.blocks = vec![entry, header, exit];
        f.label_to_block = [(l0, 0), (l1, 1), (l2, 2)].into_iter().collect();

        passes::de_ssa(&mut f).unwrap();

        // Execute the copies along entry -> bridge (the split self-edge).
        let mut env: std::collections::HashMap<u32, i64> = std::collections::HashMap::new();
        let run_movs = |f: &Function, idx: usize, env: &mut std::collections::HashMap<u32, i64>| {
            for instr in &f.blocks[idx].instrs {
                if instr.op != op::MOV {
                    continue;
                }
                let value = match instr.operands[0] {
                    Operand::Imm(imm) => imm.value,
                    Operand::Tmp(t) => env[&t.0],
                    _ => continue,
                };
                env.insert(instr.dest.unwrap().0, value);
            }
        };
        run_movs(&f, 0, &mut env);
        let bridge = f
            .blocks
            .iter()
            .position(|b| ![l0, l1, l2].contains(&b.label))
            .expect("critical self-edge was split");
        assert_eq!(env[&x.0], 1);
        assert_eq!(env[&y.0], 2);
        run_movs(&f, bridge, &mut env);
        assert_eq!(env[&x.0], 2, "swap lost the old value of y");
        assert_eq!(env[&y.0], 1, "swap lost the old value of x");
    }

    // Globals with observable initialization go through the module
    // constructor; teardown lands in the module destructor.
    #[test]
    fn global_string_uses_module_constructor_and_destructor() {
        let module = compile_unoptimized(|ast| {
            let l = loc();
            let dg = ast.var_decl(l, "г", Type::string());
            let lit = ast.string_lit(l, "привет");
            let asg = ast.assign(l, "г", lit);
            ast.block(l, vec![dg, asg])
        });
        let ctor_idx = module.constructor.expect("module constructor");
        let ctor = &module.functions[ctor_idx];
        assert_eq!(ctor.name, ir::MODULE_CONSTRUCTOR);
        let ctor_calls = called_names(&module, ctor);
        assert!(ctor_calls.contains(&"str_from_lit".to_string()));

        let dtor_idx = module.destructor.expect("module destructor");
        let dtor = &module.functions[dtor_idx];
        assert_eq!(dtor.name, ir::MODULE_DESTRUCTOR);
        assert!(called_names(&module, dtor).contains(&"str_release".to_string()));

        // The slot initializer records the interned literal.
        assert_eq!(module.string_literals, vec!["привет"]);
        assert!(module.slot_values.iter().flatten().next().is_some());
        assert!(module.entry_point().is_none());
    }

    #[test]
    fn assert_lowering_calls_ensure() {
        let module = compile_program(|ast| {
            let l = loc();
            let da = ast.var_decl(l, "a", Type::int());
            let ua = ast.ident(l, "a");
            let two = ast.int(l, 2);
            let cmp = ast.binary(l, op::LT, ua, two);
            let assertion = ast.assert_stmt(l, cmp);
            let body = ast.block(l, vec![da, assertion]);
            let f = ast.fun_decl(l, "ф", vec![], body, Type::void());
            ast.block(l, vec![f])
        });
        let f = module.function_by_name("ф").unwrap();
        assert_eq!(called_names(&module, f), vec!["__ensure"]);
    }

    #[test]
    fn manifest_module_imports_through_use() {
        let text = r#"
            [module]
            name = "м"

            [[functions]]
            name = "двойной"
            mangled = "twice"
            args = [{ type = "int" }]
            return = "int"
        "#;
        let config = CompilerConfig::new()
            .with_manifest(text, &std::collections::HashMap::new())
            .unwrap();
        let mut ast = Ast::new();
        let l = loc();
        let u = ast.use_module(l, "м");
        let dx = ast.var_decl(l, "x", Type::int());
        let arg = ast.int(l, 21);
        let call = ast.call_named(l, "двойной", vec![arg]);
        let asg = ast.assign(l, "x", call);
        let body = ast.block(l, vec![dx, asg]);
        let f = ast.fun_decl(l, "ф", vec![], body, Type::void());
        let root = ast.block(l, vec![u, f]);

        let module = compile(&mut ast, root, &config).unwrap();
        let ext = module.external_by_name("двойной").expect("imported external");
        assert_eq!(ext.mangled, "twice");
        let f = module.function_by_name("ф").unwrap();
        assert_eq!(called_names(&module, f), vec!["двойной"]);
    }

    #[test]
    fn continue_outside_loop_is_rejected() {
        let err = compile_err(|ast| {
            let l = loc();
            let cont = ast.continue_stmt(l);
            let body = ast.block(l, vec![cont]);
            let f = ast.fun_decl(l, "ф", vec![], body, Type::void());
            ast.block(l, vec![f])
        });
        assert!(kind_matches(&err, &|k| matches!(
            k,
            ErrorKind::ContinueNotInLoop
        )));
    }

    #[test]
    fn nested_functions_are_rejected() {
        let err = compile_err(|ast| {
            let l = loc();
            let inner_body = ast.block(l, vec![]);
            let inner = ast.fun_decl(l, "внутр", vec![], inner_body, Type::void());
            let outer_body = ast.block(l, vec![inner]);
            let outer = ast.fun_decl(l, "внеш", vec![], outer_body, Type::void());
            ast.block(l, vec![outer])
        });
        assert!(kind_matches(&err, &|k| matches!(
            k,
            ErrorKind::NestedFunctionsNotSupported | ErrorKind::AlreadyDeclared { .. }
        )));
    }

    #[test]
    fn unexpected_top_level_statement_is_rejected() {
        let err = compile_err(|ast| {
            let l = loc();
            let n = ast.int(l, 42);
            ast.block(l, vec![n])
        });
        assert!(kind_matches(&err, &|k| matches!(
            k,
            ErrorKind::UnexpectedTopLevelStatement { .. }
        )));
    }

    #[test]
    fn globals_must_precede_functions() {
        let err = compile_err(|ast| {
            let l = loc();
            let body = ast.block(l, vec![]);
            let f = ast.fun_decl(l, "ф", vec![], body, Type::void());
            let g = ast.var_decl(l, "г", Type::int());
            ast.block(l, vec![f, g])
        });
        assert!(kind_matches(&err, &|k| matches!(
            k,
            ErrorKind::VariableDeclsBeforeFunctions
        )));
    }

    // Identical input produces identical IR.
    #[test]
    fn compilation_is_deterministic() {
        let a = compile_program(factorial_program);
        let b = compile_program(factorial_program);
        assert_eq!(a.print(), b.print());
    }

    #[test]
    fn entry_point_finds_user_function() {
        let module = compile_program(while_counter_program);
        assert_eq!(
            module.entry_point().map(|f| f.name.as_str()),
            Some("главная")
        );
    }

    // Terminator property: after lowering, every block ends with exactly
    // one of jmp, cmp, ret.
    #[test]
    fn every_block_ends_with_a_terminator() {
        let module = compile_unoptimized(continue_program);
        for f in &module.functions {
            for block in &f.blocks {
                let term = block.terminator().unwrap_or_else(|| {
                    panic!("block {} of {} lacks a terminator", block.label.0, f.name)
                });
                let terminators = block
                    .instrs
                    .iter()
                    .filter(|i| i.op == op::JMP || i.op == op::CMP || i.op == op::RET)
                    .count();
                assert_eq!(terminators, 1);
                assert_eq!(block.instrs.last().map(|i| i.op), Some(term.op));
            }
        }
    }
}
