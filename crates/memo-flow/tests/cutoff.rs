//! Early cutoff across a diamond, with exact perf-counter expectations.

use std::cell::Cell;
use std::rc::Rc;

use memo_flow::{cutoff_eq, Engine, Invalidation, Memo};

struct Diamond {
    engine: Engine,
    summit: Memo<u32, u32>,
    base_calls: Rc<Cell<u32>>,
}

/// base (cutoff) -> no_cutoff, yes_cutoff; each -> after_*; both -> summit.
/// `base` consumes the run counter, so it re-restores every run, but its
/// output never changes.
fn diamond() -> Diamond {
    let engine = Engine::new();
    let base_calls = Rc::new(Cell::new(0u32));

    let base: Memo<u32, u32> = {
        let base_calls = base_calls.clone();
        engine.create("base", cutoff_eq(), move |ctx, _x| {
            let base_calls = base_calls.clone();
            async move {
                base_calls.set(base_calls.get() + 1);
                let _ = ctx.current_run().await?;
                Ok(1)
            }
        })
    };
    let no_cutoff: Memo<u32, u32> = {
        let base = base.clone();
        engine.create("no_cutoff", None, move |ctx, x| {
            let base = base.clone();
            async move { ctx.exec(&base, x).await }
        })
    };
    let yes_cutoff: Memo<u32, u32> = {
        let base = base.clone();
        engine.create("yes_cutoff", cutoff_eq(), move |ctx, x| {
            let base = base.clone();
            async move { ctx.exec(&base, x).await }
        })
    };
    let after_no: Memo<u32, u32> = {
        let no_cutoff = no_cutoff.clone();
        engine.create("after_no", None, move |ctx, x| {
            let no_cutoff = no_cutoff.clone();
            async move { Ok(ctx.exec(&no_cutoff, x).await? + 1) }
        })
    };
    let after_yes: Memo<u32, u32> = {
        let yes_cutoff = yes_cutoff.clone();
        engine.create("after_yes", None, move |ctx, x| {
            let yes_cutoff = yes_cutoff.clone();
            async move { Ok(ctx.exec(&yes_cutoff, x).await? + 1) }
        })
    };
    let summit: Memo<u32, u32> = {
        let after_no = after_no.clone();
        let after_yes = after_yes.clone();
        engine.create("summit", None, move |ctx, offset| {
            let after_no = after_no.clone();
            let after_yes = after_yes.clone();
            async move {
                let a = ctx.exec(&after_no, 0).await?;
                let b = ctx.exec(&after_yes, 0).await?;
                Ok(a + b + offset)
            }
        })
    };

    Diamond {
        engine,
        summit,
        base_calls,
    }
}

fn exec_summit(d: &Diamond, offset: u32) -> u32 {
    let summit = d.summit.clone();
    d.engine
        .run(|ctx| async move { ctx.exec(&summit, offset).await })
        .unwrap()
}

#[test]
fn test_diamond_cutoff_across_runs() {
    let d = diamond();
    let perf = d.engine.perf();

    // First run: everything is computed (six cells plus the run cell).
    assert_eq!(exec_summit(&d, 0), 4);
    let report = perf.report_for_current_run();
    assert_eq!(report.computed, 7);
    assert_eq!(report.restored, 0);
    assert_eq!(d.base_calls.get(), 1);
    perf.assert_invariants();

    // Same run, new summit input: only the new cell computes; its two
    // dependency reads hit settled cells.
    perf.reset();
    assert_eq!(exec_summit(&d, 1), 5);
    let report = perf.report_for_current_run();
    assert_eq!(report.computed, 1);
    assert_eq!(report.restored, 0);
    assert_eq!(report.traversed_edges, 2);
    perf.assert_invariants();

    // New run: base re-runs because the run counter changed, but its output
    // is unchanged, so the cutoff shields the yes_cutoff side; the no_cutoff
    // side recomputes all the way up.
    d.engine.reset(Invalidation::empty());
    assert_eq!(exec_summit(&d, 0), 4);
    assert_eq!(d.base_calls.get(), 2);
    let report = perf.report_for_current_run();
    assert_eq!(report.restored, 6);
    assert_eq!(report.computed, 5);
    assert_eq!(report.traversed_edges, 11);
    perf.assert_invariants();
}

#[test]
fn test_cutoff_preserves_dependents() {
    let engine = Engine::new();
    let dependent_calls = Rc::new(Cell::new(0u32));
    let source = Rc::new(Cell::new(10u32));

    // `floor` collapses its input to a bucket; with a cutoff, changing the
    // source within a bucket never reaches the dependent.
    let floor: Memo<(), u32> = {
        let source = source.clone();
        engine.create("floor", cutoff_eq(), move |_ctx, _x| {
            let source = source.clone();
            async move { Ok(source.get() / 10) }
        })
    };
    let shown: Memo<(), u32> = {
        let floor = floor.clone();
        let dependent_calls = dependent_calls.clone();
        engine.create("shown", None, move |ctx, _x| {
            let floor = floor.clone();
            let dependent_calls = dependent_calls.clone();
            async move {
                dependent_calls.set(dependent_calls.get() + 1);
                Ok(ctx.exec(&floor, ()).await? * 100)
            }
        })
    };

    // Settle `floor` first, then read `shown`: once the invalidated cell has
    // recomputed to an equal value, the dependent restores instead of
    // re-running.
    let run_both = |engine: &Engine, floor: &Memo<(), u32>, shown: &Memo<(), u32>| {
        let floor = floor.clone();
        let shown = shown.clone();
        engine
            .run(|ctx| async move {
                ctx.exec(&floor, ()).await?;
                ctx.exec(&shown, ()).await
            })
            .unwrap()
    };

    assert_eq!(run_both(&engine, &floor, &shown), 100);
    assert_eq!(dependent_calls.get(), 1);

    // Change within the bucket: floor recomputes to the same value and the
    // dependent is untouched.
    source.set(15);
    engine.reset(floor.cell(()).invalidate());
    assert_eq!(run_both(&engine, &floor, &shown), 100);
    assert_eq!(dependent_calls.get(), 1);

    // Cross the bucket boundary: the dependent recomputes.
    source.set(25);
    engine.reset(floor.cell(()).invalidate());
    assert_eq!(run_both(&engine, &floor, &shown), 200);
    assert_eq!(dependent_calls.get(), 2);
}
