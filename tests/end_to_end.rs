use blockforge::ir::{ArithOp, Condition};
use blockforge::lir::{BranchTarget, LirOp, LirOpcode, StubId, StubKind};
use blockforge::operand::{BasicType, Constant, Operand, Reg};
use blockforge::{
    BarrierConfig, CompileOptions, CompiledMethod, Compiler, Graph, GraphBuilder, TargetDescriptor,
};

fn compile(g: &Graph, target: TargetDescriptor, options: CompileOptions) -> CompiledMethod {
    Compiler::new(target, options)
        .unwrap()
        .compile_method(g)
        .unwrap()
}

fn all_ops(m: &CompiledMethod) -> Vec<&LirOp> {
    m.blocks.iter().flat_map(|b| &b.ops).collect()
}

fn stub_of(m: &CompiledMethod, pred: impl Fn(&StubKind) -> bool) -> StubId {
    m.stubs.iter().find(|s| pred(&s.kind)).map(|s| s.id).unwrap()
}

fn branch_to(op: &LirOp, stub: StubId) -> bool {
    matches!(op.code, LirOpcode::Branch { target: BranchTarget::Stub(s), .. } if s == stub)
}

/// Every virtual register that is read has a definition somewhere
fn assert_vregs_defined(m: &CompiledMethod) {
    let ops = all_ops(m);
    let defined: Vec<&Operand> = ops.iter().map(|o| &o.result).collect();
    for op in &ops {
        for input in &op.inputs {
            if let Operand::Reg(Reg::Virtual(_), _) = input {
                let reg = input.as_reg();
                assert!(
                    defined.iter().any(|d| d.as_reg() == reg),
                    "{} read but never written\n{}",
                    input,
                    m
                );
            }
        }
    }
}

/// `int f(int x) { return x * 7; }`
fn times_seven() -> Graph {
    let mut b = GraphBuilder::new("times_seven");
    let entry = b.start();
    let x = b.param(0, BasicType::Int);
    let seven = b.int(7);
    let r = b.arith(entry, ArithOp::Mul, BasicType::Int, x, seven);
    b.ret(entry, Some(r));
    b.finish().unwrap()
}

#[test]
fn multiply_by_seven_is_shift_and_subtract() {
    for target in [TargetDescriptor::aarch64(), TargetDescriptor::arm32()] {
        let m = compile(&times_seven(), target, CompileOptions::default());
        let ops = all_ops(&m);
        assert!(!ops.iter().any(|o| o.code == LirOpcode::Mul), "{}", m);
        assert!(ops.iter().any(|o| o.code == LirOpcode::Sub), "{}", m);
    }
}

#[test]
fn divide_checks_zero_before_dividing() {
    let mut b = GraphBuilder::new("divide");
    let entry = b.start();
    let x = b.param(0, BasicType::Int);
    let y = b.param(1, BasicType::Int);
    let q = b.arith(entry, ArithOp::Div, BasicType::Int, x, y);
    b.ret(entry, Some(q));
    let g = b.finish().unwrap();

    let m = compile(&g, TargetDescriptor::aarch64(), CompileOptions::default());
    let ops = all_ops(&m);
    let stub = stub_of(&m, |k| *k == StubKind::DivByZero);
    let check = ops.iter().position(|o| branch_to(o, stub)).unwrap();
    let zero_cmp = ops.iter().position(|o| o.code == LirOpcode::Cmp).unwrap();
    let div = ops.iter().position(|o| o.code == LirOpcode::Div).unwrap();
    assert!(zero_cmp < check && check < div, "{}", m);
    assert_eq!(ops[zero_cmp].inputs[1], Operand::Const(Constant::Int(0)));
}

#[test]
fn array_base_is_hoisted_out_of_the_loop() {
    // for (i = 0; i < n; i++) a[i] = i;
    let mut b = GraphBuilder::new("fill");
    let entry = b.start();
    let a = b.param(0, BasicType::Array);
    let n = b.param(1, BasicType::Int);
    let zero = b.int(0);
    let one = b.int(1);
    let head = b.region();
    let body = b.region();
    let exit = b.region();
    b.goto(entry, head);
    let i = b.phi(head, BasicType::Int);
    b.branch(head, Condition::Less, i, n, body, exit, 0.9);
    let base = b.element_base(a, BasicType::Int);
    b.store_indexed(body, a, i, i, BasicType::Int, Some(base));
    let next = b.arith(body, ArithOp::Add, BasicType::Int, i, one);
    b.goto_safepoint(body, head);
    b.add_phi_input(i, zero);
    b.add_phi_input(i, next);
    b.ret(exit, None);
    let g = b.finish().unwrap();

    let target = TargetDescriptor::aarch64();
    let offset = target.array_base_offset(BasicType::Int);
    let m = compile(&g, target, CompileOptions::default());
    let is_base_add = |o: &LirOp| {
        o.code == LirOpcode::Add && o.inputs.get(1) == Some(&Operand::Const(Constant::Int(offset as i32)))
    };
    let homes: Vec<u32> = m
        .blocks
        .iter()
        .filter(|blk| blk.ops.iter().any(is_base_add))
        .map(|blk| blk.loop_depth)
        .collect();
    assert_eq!(homes, vec![0], "{}", m);
    assert_eq!(m.loop_heads.len(), 1);
    // the store itself sits in the loop
    assert!(m
        .blocks
        .iter()
        .filter(|blk| blk.loop_depth > 0)
        .flat_map(|blk| &blk.ops)
        .any(|o| o.result.as_address().is_some()));
}

#[test]
fn object_array_store_sequence() {
    let mut b = GraphBuilder::new("store_obj");
    let entry = b.start();
    let arr = b.param(0, BasicType::Array);
    let i = b.param(1, BasicType::Int);
    let obj = b.param(2, BasicType::Object);
    b.store_indexed(entry, arr, i, obj, BasicType::Object, None);
    b.ret(entry, None);
    let g = b.finish().unwrap();

    let options = CompileOptions {
        barrier: BarrierConfig::satb(),
        ..CompileOptions::default()
    };
    for target in [TargetDescriptor::aarch64(), TargetDescriptor::arm32()] {
        let m = compile(&g, target, options.clone());
        let ops = all_ops(&m);
        let range = stub_of(&m, |k| matches!(k, StubKind::RangeCheck { .. }));
        let pre = stub_of(&m, |k| matches!(k, StubKind::PreBarrier { .. }));

        let address = ops.iter().position(|o| o.code == LirOpcode::Lea).unwrap();
        let range_branch = ops.iter().position(|o| branch_to(o, range)).unwrap();
        let store_check = ops.iter().position(|o| o.code == LirOpcode::StoreCheck).unwrap();
        let pre_branch = ops.iter().position(|o| branch_to(o, pre)).unwrap();
        let store = ops
            .iter()
            .position(|o| o.result.as_address().map_or(false, |a| a.ty == BasicType::Object))
            .unwrap();
        let card = ops
            .iter()
            .rposition(|o| o.result.as_address().map_or(false, |a| a.ty == BasicType::Byte))
            .unwrap();
        let order = [address, range_branch, store_check, pre_branch, store, card];
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}\n{}", order, m);
    }
}

#[test]
fn storing_null_skips_the_store_check() {
    let mut b = GraphBuilder::new("store_null");
    let entry = b.start();
    let arr = b.param(0, BasicType::Array);
    let i = b.param(1, BasicType::Int);
    let null = b.null();
    b.store_indexed(entry, arr, i, null, BasicType::Object, None);
    b.ret(entry, None);
    let g = b.finish().unwrap();

    let m = compile(&g, TargetDescriptor::aarch64(), CompileOptions::default());
    assert!(!all_ops(&m).iter().any(|o| o.code == LirOpcode::StoreCheck));

    let profiling = CompileOptions {
        profile_stores: true,
        ..CompileOptions::default()
    };
    let m = compile(&g, TargetDescriptor::aarch64(), profiling);
    assert!(all_ops(&m).iter().any(|o| o.code == LirOpcode::StoreCheck));
}

#[test]
fn batch_compiles_in_input_order() {
    let compiler = Compiler::new(TargetDescriptor::arm32(), CompileOptions::default()).unwrap();
    let graphs: Vec<Graph> = (0..8)
        .map(|k| {
            let mut g = times_seven();
            g.name = format!("f{}", k);
            g
        })
        .collect();
    let results = compiler.compile_batch(graphs, 4);
    assert_eq!(results.len(), 8);
    for (k, r) in results.into_iter().enumerate() {
        assert_eq!(r.unwrap().name, format!("f{}", k));
    }
}

#[test]
fn graph_survives_json() {
    let g = times_seven();
    let text = serde_json::to_string(&g).unwrap();
    let back: Graph = serde_json::from_str(&text).unwrap();
    let m = compile(&back, TargetDescriptor::aarch64(), CompileOptions::default());
    assert_eq!(m.name, "times_seven");
}

#[test]
fn phi_behind_a_conditional_branch_gets_its_move() {
    // s = x + 1; if (x < y) return phi(s) else return x
    let mut b = GraphBuilder::new("branch_phi");
    let entry = b.start();
    let x = b.param(0, BasicType::Int);
    let y = b.param(1, BasicType::Int);
    let one = b.int(1);
    let s = b.arith(entry, ArithOp::Add, BasicType::Int, x, one);
    let then = b.region();
    let other = b.region();
    b.branch(entry, Condition::Less, x, y, then, other, 0.5);
    let phi = b.phi(then, BasicType::Int);
    b.add_phi_input(phi, s);
    b.ret(then, Some(phi));
    b.ret(other, Some(x));
    let g = b.finish().unwrap();

    for target in [TargetDescriptor::aarch64(), TargetDescriptor::arm32()] {
        let m = compile(&g, target, CompileOptions::default());
        assert_vregs_defined(&m);
    }
}

#[test]
fn phi_behind_a_switch_gets_its_move() {
    let mut b = GraphBuilder::new("switch_phi");
    let entry = b.start();
    let x = b.param(0, BasicType::Int);
    let one = b.int(1);
    let s = b.arith(entry, ArithOp::Add, BasicType::Int, x, one);
    let first = b.region();
    let second = b.region();
    let default = b.region();
    b.switch(entry, x, vec![1, 2], vec![first, second, default]);
    let phi = b.phi(first, BasicType::Int);
    b.add_phi_input(phi, s);
    b.ret(first, Some(phi));
    b.ret(second, Some(x));
    b.ret(default, Some(one));
    let g = b.finish().unwrap();

    for target in [TargetDescriptor::arm32(), TargetDescriptor::aarch64()] {
        let m = compile(&g, target, CompileOptions::default());
        assert_vregs_defined(&m);
    }
}
