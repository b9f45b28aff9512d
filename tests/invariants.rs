//! Property tests for the timescope and action-id invariants, driven
//! through the public API with real stimulus threads.

use proptest::prelude::*;

use simscope::{DesignInfo, SignalId, SignalValue, TableSimulator, Tester};

const X: SignalId = SignalId(0);

fn tester() -> Tester {
    let mut design = DesignInfo::new();
    design.name(X, "x");
    Tester::new(design, TableSimulator::new())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Opening a stack of scopes and closing them innermost-first always
    /// unwinds completely (the thread's own completion asserts this), and
    /// every close reverts to the nearest enclosing scope that poked.
    #[test]
    fn prop_nested_close_reverts_to_nearest_enclosing_poke(pokes in proptest::collection::vec(any::<bool>(), 1..8)) {
        let tester = tester();
        let plan = pokes.clone();
        let t = tester.spawn(move |ctx| {
            let mut scopes = Vec::new();
            for (depth, &does_poke) in plan.iter().enumerate() {
                scopes.push(ctx.new_timescope()?);
                if does_poke {
                    ctx.poke(X, SignalValue(depth as u64 + 1))?;
                }
            }
            for (depth, scope) in scopes.into_iter().enumerate().rev() {
                let reverts = ctx.close_timescope(scope)?;
                if plan[depth] {
                    // nearest shallower scope that poked, or release
                    let expected = plan[..depth]
                        .iter()
                        .rposition(|&poked| poked)
                        .map(|shallower| SignalValue(shallower as u64 + 1));
                    assert_eq!(reverts.get(&X), Some(&expected));
                } else {
                    assert!(reverts.is_empty());
                }
            }
            Ok(())
        }).unwrap();
        tester.run_threads(&[t]).unwrap();
    }

    /// Every poke, peek, and child open consumes exactly one action id, in
    /// order, so a scope's next id equals the number of actions it saw.
    #[test]
    fn prop_action_ids_count_actions(actions in proptest::collection::vec(0u8..3, 0..16)) {
        let tester = tester();
        let plan = actions.clone();
        let t = tester.spawn(move |ctx| {
            let scope = ctx.new_timescope()?;
            let mut last = None;
            for &action in &plan {
                match action {
                    0 => ctx.poke(X, SignalValue(1))?,
                    1 => {
                        ctx.peek(X)?;
                    }
                    _ => {
                        let child = ctx.new_timescope()?;
                        ctx.close_timescope(child)?;
                    }
                }
                let next = ctx.scope_info(scope)?.next_action_id;
                if let Some(previous) = last {
                    assert!(next > previous, "action ids must strictly increase");
                }
                last = Some(next);
            }
            assert_eq!(ctx.scope_info(scope)?.next_action_id, plan.len() as u64);
            ctx.close_timescope(scope)?;
            Ok(())
        }).unwrap();
        tester.run_threads(&[t]).unwrap();
    }

    /// Forked children always sit one level below their spawner, and their
    /// thread root chains into the spawning scope.
    #[test]
    fn prop_fork_depth_tracks_nesting(depth in 1usize..6) {
        let tester = tester();
        let t = tester.spawn(move |ctx| {
            fn descend(ctx: &simscope::Context, remaining: usize) -> simscope::Result<()> {
                if remaining == 0 {
                    return Ok(());
                }
                let child = ctx.fork(move |ctx| descend(ctx, remaining - 1))?;
                ctx.join(child)
            }
            descend(ctx, depth)
        }).unwrap();
        tester.run_threads(&[t]).unwrap();
    }
}
