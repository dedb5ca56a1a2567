use std::sync::Arc;

use symstack::arch::{x86, Convention};
use symstack::builder::StateBuilder;
use symstack::expr::{BinOp, BinRel, SymVar};
use symstack::executor::Executor;
use symstack::explorer::{Outcome, PathExplorer};
use symstack::frame::FrameLayout;
use symstack::ir::{Opcode, Operand, ProgramImage};
use symstack::solver::SolverContext;

const BASE: u64 = 0x8048000;
const PASSWORD: &[u8; 16] = b"GOODSTACKFRAMES!";

const GOOD: &[u8] = b"Good Job.\n";
const BAD: &[u8] = b"Try again.\n";

fn words() -> Vec<SymVar> {
    (0..4).map(|i| SymVar::new(format!("p{}", i), 32)).collect()
}

fn layout() -> FrameLayout {
    let p = words();
    FrameLayout::new(0x18)
        .pad(8)
        .push(p[1].clone())
        .push(p[0].clone())
        .push(p[2].clone())
        .push(p[3].clone())
}

fn reg(r: symstack::ir::Register) -> Operand {
    Operand::register(r, 4)
}

fn imm(v: u64) -> Operand {
    Operand::constant(v, 4)
}

// Per word: eax = *(ebp - off); eax ^= k; eax += a; if eax != c goto fail
fn crackme() -> ProgramImage {
    let layout = layout();
    let checks = [(0x5a17c0deu32, 0x1337u32), (0xdeadbeef, 0x4000_0001), (0x0f0f0f0f, 0xffff_fff0), (0x12345678, 0x9)];

    let fail = BASE + (checks.len() as u64 * 6 + 2) * 4;
    let flag = Operand::variable(0, 1);

    let mut ops = Vec::new();
    for (i, (var, &(k, a))) in words().iter().zip(checks.iter()).enumerate() {
        let word = u32::from_le_bytes([
            PASSWORD[i * 4],
            PASSWORD[i * 4 + 1],
            PASSWORD[i * 4 + 2],
            PASSWORD[i * 4 + 3],
        ]);
        let expected = (word ^ k).wrapping_add(a);
        let offset = layout.offset_of(var).unwrap().unsigned_abs();

        ops.extend([
            Opcode::IntBinary {
                op: BinOp::SUB,
                destination: reg(x86::EAX),
                lhs: reg(x86::EBP),
                rhs: imm(offset),
            },
            Opcode::Load {
                destination: reg(x86::EAX),
                address: reg(x86::EAX),
            },
            Opcode::IntBinary {
                op: BinOp::XOR,
                destination: reg(x86::EAX),
                lhs: reg(x86::EAX),
                rhs: imm(k as u64),
            },
            Opcode::IntBinary {
                op: BinOp::ADD,
                destination: reg(x86::EAX),
                lhs: reg(x86::EAX),
                rhs: imm(a as u64),
            },
            Opcode::IntCompare {
                op: BinRel::NEQ,
                destination: flag.clone(),
                lhs: reg(x86::EAX),
                rhs: imm(expected as u64),
            },
            Opcode::CBranch {
                target: fail,
                condition: flag.clone(),
            },
        ]);
    }

    ops.extend([Opcode::output(GOOD), Opcode::Exit, Opcode::output(BAD), Opcode::Exit]);

    ProgramImage::assemble(BASE, 4, ops)
}

fn solve() -> (Vec<u8>, usize) {
    let _ = env_logger::builder().is_test(true).try_init();

    let program = Arc::new(crackme());
    let root = StateBuilder::new(&*program, Convention::x86())
        .entry(BASE)
        .frame(layout())
        .build()
        .unwrap();

    let executor = Executor::new(program, SolverContext::z3(), Convention::x86());
    let mut explorer = PathExplorer::new(executor, root);

    let report = explorer.explore(|out| out.starts_with(GOOD), |out| out.starts_with(BAD));
    assert_eq!(report.outcome, Outcome::Found);
    assert_eq!(report.counts.found, 1);
    assert!(explorer.avoided().all(|s| s.output() == BAD));

    let solution = explorer.solution(&words()).unwrap();
    let found = explorer.found().next().unwrap();
    assert!(solution.satisfies(found));
    assert_eq!(found.constraints().len(), 4);

    (solution.to_le_bytes(), explorer.avoided().count())
}

#[test]
fn recovers_password_from_stack_frame() {
    let (bytes, avoided) = solve();
    assert_eq!(bytes, PASSWORD.to_vec());
    assert_eq!(String::from_utf8_lossy(&bytes), "GOODSTACKFRAMES!");
    assert_eq!(avoided, 4);
}

#[test]
fn repeated_runs_agree() {
    assert_eq!(solve(), solve());
}
