//! Error caching: reproducible vs non-reproducible failures, aggregation,
//! and call-stack annotation.

use std::cell::Cell;
use std::rc::Rc;

use memo_flow::{collect_errors, fork_and_join, Engine, Errors, Invalidation, Memo};

fn area_fixture(engine: &Engine) -> (Memo<i32, i32>, Rc<Cell<u32>>) {
    let calls = Rc::new(Cell::new(0u32));
    let area: Memo<i32, i32> = {
        let calls = calls.clone();
        engine.create("area", None, move |_ctx, x| {
            let calls = calls.clone();
            async move {
                calls.set(calls.get() + 1);
                if x < 0 {
                    Err(anyhow::anyhow!("negative input: {x}").into())
                } else if x == 0 {
                    Err(Errors::non_reproducible(anyhow::anyhow!("Zero input")))
                } else {
                    Ok(x * x)
                }
            }
        })
    };
    (area, calls)
}

fn exec_area(engine: &Engine, area: &Memo<i32, i32>, x: i32) -> Result<i32, Errors> {
    let area = area.clone();
    engine.run(|ctx| async move { ctx.exec(&area, x).await })
}

#[test]
fn test_reproducible_vs_non_reproducible() {
    let engine = Engine::new();
    let (area, calls) = area_fixture(&engine);

    assert_eq!(exec_area(&engine, &area, 5).unwrap(), 25);
    let neg = exec_area(&engine, &area, -5).unwrap_err();
    assert!(neg[0].is_reproducible());
    assert!(neg.to_string().contains("negative input"));
    let zero = exec_area(&engine, &area, 0).unwrap_err();
    assert!(!zero[0].is_reproducible());
    assert_eq!(zero.to_string(), "Zero input");
    assert_eq!(calls.get(), 3);

    engine.reset(Invalidation::empty());

    // Values and reproducible errors are served from cache; the
    // non-reproducible error expires at the run boundary.
    assert_eq!(exec_area(&engine, &area, 5).unwrap(), 25);
    let _ = exec_area(&engine, &area, -5).unwrap_err();
    assert_eq!(calls.get(), 3);
    let _ = exec_area(&engine, &area, 0).unwrap_err();
    assert_eq!(calls.get(), 4);
}

#[test]
fn test_cached_error_not_rerun_within_run() {
    let engine = Engine::new();
    let (area, calls) = area_fixture(&engine);

    let first = exec_area(&engine, &area, -3).unwrap_err();
    let second = exec_area(&engine, &area, -3).unwrap_err();
    assert_eq!(calls.get(), 1);
    assert_eq!(first.to_string(), second.to_string());
}

#[test]
fn test_diamond_surfaces_failure_once() {
    let engine = Engine::new();

    let failing: Memo<u32, u32> = engine.create("failing", None, |_ctx, x| async move {
        Err(anyhow::anyhow!("broken at {x}").into())
    });
    let left: Memo<u32, u32> = {
        let failing = failing.clone();
        engine.create("left", None, move |ctx, x| {
            let failing = failing.clone();
            async move { ctx.exec(&failing, x).await }
        })
    };
    let right: Memo<u32, u32> = {
        let failing = failing.clone();
        engine.create("right", None, move |ctx, x| {
            let failing = failing.clone();
            async move { ctx.exec(&failing, x).await }
        })
    };

    // One failed cell observed through two dependents surfaces once.
    let err = engine
        .run(|ctx| {
            let left = left.clone();
            let right = right.clone();
            async move {
                fork_and_join(ctx.exec(&left, 1), ctx.exec(&right, 1)).await
            }
        })
        .unwrap_err();
    assert_eq!(err.len(), 1);

    // Two distinct failed cells surface as two errors.
    let err = engine
        .run(|ctx| {
            let left = left.clone();
            let right = right.clone();
            async move {
                fork_and_join(ctx.exec(&left, 2), ctx.exec(&right, 3)).await
            }
        })
        .unwrap_err();
    assert_eq!(err.len(), 2);
}

#[test]
fn test_collect_errors_gathers_all() {
    let engine = Engine::new();
    let failing: Memo<u32, u32> = engine.create("failing", None, |_ctx, x| async move {
        Err(anyhow::anyhow!("broken at {x}").into())
    });

    engine
        .run(|ctx| {
            let failing = failing.clone();
            async move {
                let both = fork_and_join(ctx.exec(&failing, 1), ctx.exec(&failing, 2));
                let errors = collect_errors(both).await.unwrap_err();
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().any(|e| e.to_string() == "broken at 1"));
                assert!(errors.iter().any(|e| e.to_string() == "broken at 2"));
                Ok(())
            }
        })
        .unwrap();
}

#[test]
fn test_error_carries_call_stack() {
    let engine = Engine::new();

    let inner: Memo<u32, u32> = engine.create("inner", None, |_ctx, _x| async move {
        Err(anyhow::anyhow!("inner failure").into())
    });
    let outer: Memo<u32, u32> = {
        let inner = inner.clone();
        engine.create("outer", None, move |ctx, x| {
            let inner = inner.clone();
            async move { ctx.exec(&inner, x).await }
        })
    };

    let err = engine
        .run(|ctx| {
            let outer = outer.clone();
            async move { ctx.exec(&outer, 9).await }
        })
        .unwrap_err();

    let stack = err[0].stack();
    assert_eq!(stack[0].name(), Some("inner"));
    assert_eq!(stack[0].input_as(&inner), Some(9));
    assert_eq!(stack[1].name(), Some("outer"));
}

#[test]
fn test_error_to_ok_transition() {
    let engine = Engine::new();
    let source = Rc::new(Cell::new(-1i32));

    let reading: Memo<(), i32> = {
        let source = source.clone();
        engine.create("reading", None, move |_ctx, _x| {
            let source = source.clone();
            async move {
                let value = source.get();
                if value < 0 {
                    Err(anyhow::anyhow!("negative reading").into())
                } else {
                    Ok(value)
                }
            }
        })
    };
    let doubled: Memo<(), i32> = {
        let reading = reading.clone();
        engine.create("doubled", None, move |ctx, _x| {
            let reading = reading.clone();
            async move { Ok(ctx.exec(&reading, ()).await? * 2) }
        })
    };

    let exec_doubled = |engine: &Engine, doubled: &Memo<(), i32>| {
        let doubled = doubled.clone();
        engine.run(|ctx| async move { ctx.exec(&doubled, ()).await })
    };

    assert!(exec_doubled(&engine, &doubled).is_err());

    source.set(21);
    engine.reset(reading.cell(()).invalidate());
    assert_eq!(exec_doubled(&engine, &doubled).unwrap(), 42);

    source.set(-7);
    engine.reset(reading.cell(()).invalidate());
    assert!(exec_doubled(&engine, &doubled).is_err());
}
