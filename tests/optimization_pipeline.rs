//! Optimization pipeline properties on whole modules.

use tpde_jit::ir::parser::parse_module;
use tpde_jit::opt::optimize_module;
use tpde_jit::{OptLevel, ThreadSafeContext};

const SRC: &str = r#"
global @table = 7

define @clamp(%x, %lo, %hi) {
entry:
    %below = icmp slt %x, %lo
    br %below, done(%lo), upper
upper:
    %above = icmp sgt %x, %hi
    br %above, done(%hi), done(%x)
done(%r):
    ret %r
}

define @mix(%a, %b) {
entry:
    %one = iconst 1
    %two = iconst 2
    %three = add %one, %two
    %x = add %a, %three
    %y = add %three, %a
    %z = sub %x, %y
    %p = addr @table
    %q = addr @table
    %v = load %p
    %w = load %q
    %s = add %v, %w
    %t = add %s, %z
    %k = iconst 0
    %c = icmp ne %k, %k
    br %c, dead, live(%t)
dead:
    ret %b
live(%u):
    %m = mul %u, %one
    ret %m
}
"#;

#[test]
fn test_second_run_only_shrinks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = ThreadSafeContext::new();
    let mut module = parse_module(SRC, "opt", &ctx).unwrap();

    let first = optimize_module(&mut module, OptLevel::Default);
    module.verify().unwrap();
    assert!(first.total_changes() > 0);
    assert_eq!(first.functions, 2);

    let second = optimize_module(&mut module, OptLevel::Default);
    module.verify().unwrap();
    assert_eq!(second.instructions_before, first.instructions_after);
    assert!(second.instructions_after <= second.instructions_before);
    let settled = module.to_string();

    // Repeated runs settle.
    let settles = (0..8).any(|_| optimize_module(&mut module, OptLevel::Default).total_changes() == 0);
    assert!(settles);
    let final_text = module.to_string();
    optimize_module(&mut module, OptLevel::Default);
    assert_eq!(module.to_string(), final_text);
    assert!(final_text.len() <= settled.len());
}

#[test]
fn test_pipeline_shrinks_redundant_code() {
    let ctx = ThreadSafeContext::new();
    let mut module = parse_module(SRC, "opt", &ctx).unwrap();
    let stats = optimize_module(&mut module, OptLevel::Default);

    let mix = module.function("mix").unwrap();
    assert_eq!(mix.blocks.len(), 1);
    let text = mix.to_string();
    assert_eq!(text.matches("addr @table").count(), 1, "{text}");
    // Loads are never merged.
    assert_eq!(text.matches("load").count(), 2, "{text}");
    assert!(!text.contains("mul"), "{text}");
    assert!(stats.instructions_after < stats.instructions_before);

    // The clamp join point is kept.
    assert_eq!(module.function("clamp").unwrap().blocks.len(), 3);
}

#[test]
fn test_none_leaves_module_untouched() {
    let ctx = ThreadSafeContext::new();
    let mut module = parse_module(SRC, "opt", &ctx).unwrap();
    let before = module.to_string();
    let stats = optimize_module(&mut module, OptLevel::None);
    assert_eq!(stats.total_changes(), 0);
    assert_eq!(module.to_string(), before);
}

#[test]
fn test_display_round_trips_through_parser() {
    let ctx = ThreadSafeContext::new();
    let module = parse_module(SRC, "opt", &ctx).unwrap();
    let text = module.to_string();
    let reparsed = parse_module(&text, "opt", &ctx).unwrap();
    assert_eq!(reparsed.to_string(), text);
}
