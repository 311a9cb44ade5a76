//! Per-cell, per-function and global invalidation, applied at run boundaries.

use std::cell::Cell;
use std::rc::Rc;

use memo_flow::{Engine, Invalidation, Memo};

fn counted_double(engine: &Engine, name: &str) -> (Memo<u32, u32>, Rc<Cell<u32>>) {
    let calls = Rc::new(Cell::new(0u32));
    let memo = {
        let calls = calls.clone();
        engine.create(name, None, move |_ctx, x| {
            let calls = calls.clone();
            async move {
                calls.set(calls.get() + 1);
                Ok(x * 2)
            }
        })
    };
    (memo, calls)
}

fn exec(engine: &Engine, memo: &Memo<u32, u32>, x: u32) -> u32 {
    let memo = memo.clone();
    engine
        .run(|ctx| async move { ctx.exec(&memo, x).await })
        .unwrap()
}

#[test]
fn test_cell_invalidation() {
    let engine = Engine::new();
    let (double, calls) = counted_double(&engine, "double");

    assert_eq!(exec(&engine, &double, 3), 6);
    assert_eq!(exec(&engine, &double, 4), 8);
    assert_eq!(calls.get(), 2);

    engine.reset(double.cell(3).invalidate());

    // Only the marked cell recomputes.
    assert_eq!(exec(&engine, &double, 3), 6);
    assert_eq!(exec(&engine, &double, 4), 8);
    assert_eq!(calls.get(), 3);
}

#[test]
fn test_function_invalidation() {
    let engine = Engine::new();
    let (double, calls) = counted_double(&engine, "double");

    exec(&engine, &double, 1);
    exec(&engine, &double, 2);
    assert_eq!(calls.get(), 2);

    engine.reset(double.invalidate_cache());

    exec(&engine, &double, 1);
    exec(&engine, &double, 2);
    assert_eq!(calls.get(), 4);
}

#[test]
fn test_combine_is_a_union() {
    let engine = Engine::new();
    let (double, calls) = counted_double(&engine, "double");

    exec(&engine, &double, 1);
    exec(&engine, &double, 2);
    exec(&engine, &double, 3);

    let inv = Invalidation::empty()
        .combine(double.cell(1).invalidate())
        .combine(double.cell(3).invalidate());
    assert!(!inv.is_empty());
    engine.reset(inv);

    exec(&engine, &double, 1);
    exec(&engine, &double, 2);
    exec(&engine, &double, 3);
    assert_eq!(calls.get(), 5);
}

#[test]
fn test_empty_reset_recomputes_nothing() {
    let engine = Engine::new();
    let (double, calls) = counted_double(&engine, "double");

    exec(&engine, &double, 5);
    engine.reset(Invalidation::empty());
    exec(&engine, &double, 5);
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_clear_caches() {
    let engine = Engine::new();
    let (double, calls) = counted_double(&engine, "double");
    let (triple, _) = counted_double(&engine, "triple");

    exec(&engine, &double, 2);
    exec(&engine, &triple, 2);
    assert!(double.previously_evaluated_cell(&2).is_some());
    assert!(triple.previously_evaluated_cell(&2).is_some());
    assert!(double.get_deps(&2).is_some());

    engine.reset(Invalidation::clear_caches());

    assert!(double.previously_evaluated_cell(&2).is_none());
    assert!(triple.previously_evaluated_cell(&2).is_none());
    assert!(double.get_deps(&2).is_none());

    assert_eq!(exec(&engine, &double, 2), 4);
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_abandoned_compute_restarts_on_demand() {
    let engine = Engine::new();
    let flag = Rc::new(Cell::new(1u32));
    let dep_calls = Rc::new(Cell::new(0u32));

    let dep: Memo<u32, u32> = {
        let dep_calls = dep_calls.clone();
        engine.create("dep", None, move |_ctx, x| {
            let dep_calls = dep_calls.clone();
            async move {
                dep_calls.set(dep_calls.get() + 1);
                Ok(x + 100)
            }
        })
    };
    let top: Memo<u32, u32> = {
        let dep = dep.clone();
        let flag = flag.clone();
        engine.create("top", None, move |ctx, x| {
            let dep = dep.clone();
            let flag = flag.clone();
            async move {
                if flag.get() == 1 {
                    ctx.exec(&dep, x).await
                } else {
                    Ok(0)
                }
            }
        })
    };

    let exec_top = |engine: &Engine, top: &Memo<u32, u32>| {
        let top = top.clone();
        engine
            .run(|ctx| async move { ctx.exec(&top, 1).await })
            .unwrap()
    };
    let exec_dep = |engine: &Engine, dep: &Memo<u32, u32>| {
        let dep = dep.clone();
        engine
            .run(|ctx| async move { ctx.exec(&dep, 1).await })
            .unwrap()
    };

    assert_eq!(exec_top(&engine, &top), 101);
    assert_eq!(dep_calls.get(), 1);

    // Invalidate dep; top's restore abandons it without computing, because
    // top's new body no longer demands it.
    flag.set(2);
    engine.reset(dep.cell(1).invalidate());
    assert_eq!(exec_top(&engine, &top), 0);
    assert_eq!(dep_calls.get(), 1);

    // A direct demand restarts the abandoned compute, running the body again.
    assert_eq!(exec_dep(&engine, &dep), 101);
    assert_eq!(dep_calls.get(), 2);
}
