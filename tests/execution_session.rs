//! End-to-end tests of the execution session.
//!
//! Modules are parsed from text IR, added to a session, looked up by name and
//! called through the returned addresses.

#![cfg(all(target_arch = "x86_64", unix))]

use std::mem::transmute;
use std::sync::Barrier;
use tpde_jit::ir::parser::parse_module;
use tpde_jit::{
    ExecutionSession, JitConfig, JitError, Linkage, Module, ModuleKey, OptLevel, ShadowPolicy,
};

type Fn0 = extern "C" fn() -> i64;
type Fn1 = extern "C" fn(i64) -> i64;
type Fn2 = extern "C" fn(i64, i64) -> i64;

fn session_with(config: JitConfig) -> ExecutionSession {
    let _ = env_logger::builder().is_test(true).try_init();
    ExecutionSession::create(config).unwrap()
}

fn session() -> ExecutionSession {
    session_with(JitConfig::default())
}

fn add(session: &ExecutionSession, name: &str, src: &str) -> Result<ModuleKey, JitError> {
    let module = parse_module(src, name, session.context()).unwrap();
    session.add_module(module)
}

fn fn0(session: &ExecutionSession, name: &str) -> Fn0 {
    let address = session.lookup(name).unwrap();
    unsafe { transmute::<usize, Fn0>(address as usize) }
}

fn fn1(session: &ExecutionSession, name: &str) -> Fn1 {
    let address = session.lookup(name).unwrap();
    unsafe { transmute::<usize, Fn1>(address as usize) }
}

fn fn2(session: &ExecutionSession, name: &str) -> Fn2 {
    let address = session.lookup(name).unwrap();
    unsafe { transmute::<usize, Fn2>(address as usize) }
}

const ADD: &str = r#"
define @add(%a, %b) {
entry:
    %s = add %a, %b
    ret %s
}
"#;

const HELPER: &str = r#"
define internal @helper(%x) {
entry:
    %two = iconst 2
    %r = mul %x, %two
    ret %r
}

define @useHelper(%x) {
entry:
    %r = call @helper(%x)
    %one = iconst 1
    %s = add %r, %one
    ret %s
}
"#;

#[test]
fn test_add_returns_sum() {
    let session = session();
    add(&session, "add", ADD).unwrap();
    let f = fn2(&session, "add");
    assert_eq!(f(2, 3), 5);
    assert_eq!(f(-7, 3), -4);

    let stats = session.stats();
    assert_eq!(stats.modules_added, 1);
    assert_eq!(stats.functions_compiled, 1);
    assert!(stats.total_code_size > 0);
}

#[test]
fn test_internal_helper_is_hidden() {
    let session = session();
    let key = add(&session, "helper", HELPER).unwrap();

    assert!(matches!(
        session.lookup("helper"),
        Err(JitError::SymbolNotFound { ref name }) if name == "helper"
    ));
    assert_eq!(fn1(&session, "useHelper")(20), 41);
    assert_eq!(session.exported_symbols(key).unwrap(), vec!["useHelper"]);
}

#[test]
fn test_host_process_symbol_is_resolved() {
    let session = session();
    add(
        &session,
        "host",
        r#"
global internal const @msg = "hello\00"

define @msg_len() {
entry:
    %p = addr @msg
    %n = call @strlen(%p)
    ret %n
}
"#,
    )
    .unwrap();
    assert_eq!(fn0(&session, "msg_len")(), 5);
}

extern "C" fn host_triple(x: i64) -> i64 {
    x * 3
}

#[test]
fn test_absolute_symbols_are_resolved() {
    let session = session_with(JitConfig::default().with_process_symbols(false));
    session.define_absolute_symbols([("host_triple", host_triple as Fn1 as usize as u64)]);
    add(
        &session,
        "abs",
        "define @nine() {\nentry:\n  %x = iconst 3\n  %r = call @host_triple(%x)\n  ret %r\n}\n",
    )
    .unwrap();
    assert_eq!(fn0(&session, "nine")(), 9);
    assert_eq!(
        session.lookup("host_triple").unwrap(),
        host_triple as Fn1 as usize as u64
    );
}

#[test]
fn test_undefined_symbol_fails_without_registering() {
    let session = session_with(JitConfig::default().with_process_symbols(false));
    let err = add(
        &session,
        "broken",
        "define @broken() {\nentry:\n  %r = call @does_not_exist()\n  ret %r\n}\n",
    )
    .unwrap_err();
    assert!(matches!(err, JitError::UndefinedSymbol { ref name } if name == "does_not_exist"));
    assert_eq!(session.module_count(), 0);
    assert!(session.lookup("broken").is_err());
    assert_eq!(session.stats().failed_adds, 1);
}

#[test]
fn test_module_built_with_builder() {
    let session = session();
    let mut module = Module::new("built", session.context());
    module.add_global_i64("total", Linkage::Exported, 0);
    {
        let mut b = module.add_function("accumulate", Linkage::Exported, 1, false);
        let x = b.params()[0];
        let p = b.symbol_addr("total");
        let v = b.load(p);
        let n = b.add(v, x);
        b.store(p, n);
        b.ret(None);
    }
    {
        let mut b = module.add_function("run", Linkage::Exported, 2, true);
        let entry = b.current_block();
        let params = b.params();
        b.call_void("accumulate", &[params[0]]);
        b.call_void("accumulate", &[params[1]]);
        assert_eq!(b.current_block(), entry);
        let p = b.symbol_addr("total");
        let t = b.load(p);
        b.ret(Some(t));
    }
    if let Some(func) = module.function_mut("accumulate") {
        func.linkage = Linkage::Internal;
    }

    let key = session.add_module(module).unwrap();
    assert_eq!(session.exported_symbols(key).unwrap(), vec!["run", "total"]);
    let run = fn2(&session, "run");
    assert_eq!(run(2, 3), 5);
    assert_eq!(run(10, -1), 14);
}

#[test]
fn test_independent_modules_and_cross_module_calls() {
    let session = session();
    add(&session, "add", ADD).unwrap();
    add(
        &session,
        "user",
        "define @add_ten(%x) {\nentry:\n  %ten = iconst 10\n  %r = call @add(%x, %ten)\n  ret %r\n}\n",
    )
    .unwrap();
    add(&session, "helper", HELPER).unwrap();

    assert_eq!(session.module_count(), 3);
    assert_eq!(fn1(&session, "add_ten")(5), 15);
    assert_eq!(fn2(&session, "add")(40, 2), 42);
    assert_eq!(fn1(&session, "useHelper")(1), 3);
}

#[test]
fn test_global_data_is_relocated() {
    let session = session();
    add(
        &session,
        "counter",
        r#"
global @counter = 41

define @bump() {
entry:
    %p = addr @counter
    %v = load %p
    %one = iconst 1
    %n = add %v, %one
    store %p, %n
    ret %n
}
"#,
    )
    .unwrap();

    let bump = fn0(&session, "bump");
    assert_eq!(bump(), 42);
    assert_eq!(bump(), 43);
    let counter = session.lookup("counter").unwrap() as *const i64;
    assert_eq!(unsafe { *counter }, 43);
}

#[test]
fn test_duplicate_exports_rejected_in_either_order() {
    let session = session();
    let first = add(&session, "first", ADD).unwrap();
    let err = add(&session, "second", ADD).unwrap_err();
    assert!(matches!(err, JitError::DuplicateSymbol { ref name } if name == "add"));
    assert_eq!(session.module_count(), 1);

    session.remove_module(first).unwrap();
    let second = add(&session, "second", ADD).unwrap();
    assert!(matches!(
        add(&session, "first", ADD),
        Err(JitError::DuplicateSymbol { .. })
    ));
    assert!(session.contains_module(second));
    assert_eq!(fn2(&session, "add")(1, 1), 2);
}

#[test]
fn test_lifo_shadowing() {
    let session = session_with(JitConfig::default().with_shadow_policy(ShadowPolicy::AllowLifo));
    let older = add(&session, "v1", "define @version() {\nentry:\n  %v = iconst 1\n  ret %v\n}\n")
        .unwrap();
    let newer = add(&session, "v2", "define @version() {\nentry:\n  %v = iconst 2\n  ret %v\n}\n")
        .unwrap();
    assert_eq!(fn0(&session, "version")(), 2);

    session.remove_module(newer).unwrap();
    assert_eq!(fn0(&session, "version")(), 1);
    session.remove_module(older).unwrap();
    assert!(session.lookup("version").is_err());
}

#[test]
fn test_removal_hides_names() {
    let session = session();
    let key = add(&session, "add", ADD).unwrap();
    assert!(session.lookup("add").is_ok());

    session.remove_module(key).unwrap();
    assert!(matches!(session.lookup("add"), Err(JitError::SymbolNotFound { .. })));
    assert!(matches!(session.remove_module(key), Err(JitError::UnknownKey(k)) if k == key));

    let stats = session.stats();
    assert_eq!(stats.modules_added, 1);
    assert_eq!(stats.modules_removed, 1);
    assert_eq!(stats.lookup_misses, 1);
}

#[test]
fn test_unknown_names_are_not_found() {
    let session = session_with(JitConfig::default().with_process_symbols(false));
    assert!(matches!(
        session.lookup("nothing_here"),
        Err(JitError::SymbolNotFound { ref name }) if name == "nothing_here"
    ));
}

#[test]
fn test_unoptimized_and_optimized_agree() {
    const SRC: &str = r#"
define @poly(%x) {
entry:
    %a = iconst 2
    %b = iconst 3
    %c = add %a, %b
    %d = mul %x, %c
    %e = mul %c, %x
    %f = sub %d, %e
    %g = add %d, %f
    %zero = iconst 0
    %t = icmp sgt %g, %zero
    br %t, pos(%g), neg
pos(%r):
    ret %r
neg:
    %n = sub %zero, %g
    ret %n
}
"#;
    let plain = session_with(JitConfig::default().with_opt_level(OptLevel::None));
    let optimized = session();
    add(&plain, "poly", SRC).unwrap();
    add(&optimized, "poly", SRC).unwrap();

    let slow = fn1(&plain, "poly");
    let fast = fn1(&optimized, "poly");
    for x in [-5, -1, 0, 1, 7, 1000] {
        assert_eq!(slow(x), fast(x), "x = {x}");
        assert_eq!(fast(x), (5 * x).abs());
    }
    assert_eq!(plain.stats().optimization.functions, 0);
    assert!(optimized.stats().optimization.total_changes() > 0);
}

#[test]
fn test_optimizing_twice_keeps_behaviour() {
    let src = "define @collatz(%n) {\nentry:\n  %zero = iconst 0\n  jmp head(%n, %zero)\nhead(%x, %steps):\n  %one = iconst 1\n  %done = icmp sle %x, %one\n  br %done, exit(%steps), step\nstep:\n  %two = iconst 2\n  %r = srem %x, %two\n  %even = icmp eq %r, %zero\n  %s = add %steps, %one\n  br %even, half, triple\nhalf:\n  %h = sdiv %x, %two\n  jmp head(%h, %s)\ntriple:\n  %three = iconst 3\n  %t = mul %x, %three\n  %u = add %t, %one\n  jmp head(%u, %s)\nexit(%k):\n  ret %k\n}\n";
    let once = session_with(JitConfig::default().with_opt_level(OptLevel::None));
    let twice = session_with(JitConfig::default().with_opt_level(OptLevel::None));

    let mut module = parse_module(src, "once", once.context()).unwrap();
    tpde_jit::opt::optimize_module(&mut module, OptLevel::Default);
    once.add_module(module).unwrap();

    let mut module = parse_module(src, "twice", twice.context()).unwrap();
    tpde_jit::opt::optimize_module(&mut module, OptLevel::Default);
    tpde_jit::opt::optimize_module(&mut module, OptLevel::Default);
    twice.add_module(module).unwrap();

    let (a, b) = (fn1(&once, "collatz"), fn1(&twice, "collatz"));
    for n in [1, 2, 3, 6, 7, 27] {
        assert_eq!(a(n), b(n), "n = {n}");
    }
    assert_eq!(a(27), 111);
}

#[test]
fn test_lookups_from_many_threads() {
    let session = session();
    add(&session, "add", ADD).unwrap();
    std::thread::scope(|scope| {
        for i in 0..8 {
            let session = &session;
            scope.spawn(move || {
                let f = fn2(session, "add");
                assert_eq!(f(i, i), 2 * i);
            });
        }
    });
    assert_eq!(session.stats().lookups, 8);
}

#[test]
fn test_concurrent_adds_register_one_duplicate() {
    const THREADS: usize = 8;
    let session = session();
    let barrier = Barrier::new(THREADS);
    let results: Vec<Result<ModuleKey, JitError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let session = &session;
                let barrier = &barrier;
                scope.spawn(move || {
                    let src = format!("define @dup() {{\nentry:\n  %v = iconst {i}\n  ret %v\n}}\n");
                    let module = parse_module(&src, &format!("dup{i}"), session.context()).unwrap();
                    barrier.wait();
                    session.add_module(module)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<ModuleKey> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(winners.len(), 1);
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(JitError::DuplicateSymbol { name }) if name == "dup"))
        .count();
    assert_eq!(rejected, THREADS - 1);
    assert_eq!(session.module_count(), 1);
    assert!(session.contains_module(winners[0]));

    let value = fn0(&session, "dup")();
    assert!((0..THREADS as i64).contains(&value));
    assert_eq!(session.stats().failed_adds, THREADS - 1);
}

#[test]
fn test_shutdown_releases_modules() {
    let session = session();
    add(&session, "add", ADD).unwrap();
    add(&session, "helper", HELPER).unwrap();
    assert_eq!(session.module_count(), 2);
    session.shutdown();
}
