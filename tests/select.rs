//! Select and randomized select: positional priority, registration and
//! stale cleanup, and probabilistic fairness.

use fiberloop::test_utils::init_test_logging;
use fiberloop::{Channel, Clause, ErrorKind, EvLoop, SelectOutcome};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn select_prefers_earlier_ready_clauses() {
    init_test_logging();
    let ev: EvLoop<&'static str> = EvLoop::new().expect("loop");
    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let a = Channel::bounded(1);
    let b = Channel::bounded(1);

    {
        let outcomes = Rc::clone(&outcomes);
        let a = a.clone();
        let b = b.clone();
        ev.spawn(move |cx| async move {
            cx.give(&a, "A").await?;
            cx.give(&b, "B").await?;
            let first = cx.select(vec![Clause::Take(a.clone()), Clause::Take(b.clone())]).await?;
            let second = cx.select(vec![Clause::Take(b.clone()), Clause::Take(a.clone())]).await?;
            outcomes.borrow_mut().push(first);
            outcomes.borrow_mut().push(second);
            Ok(())
        });
    }
    ev.run().expect("loop");

    let outcomes = outcomes.borrow();
    assert_eq!(outcomes[0], SelectOutcome::Take(a.clone(), "A"));
    assert_eq!(outcomes[1], SelectOutcome::Take(b.clone(), "B"));
}

#[test]
fn select_fires_only_the_first_ready_give() {
    init_test_logging();
    let ev: EvLoop<&'static str> = EvLoop::new().expect("loop");
    let outcome = Rc::new(RefCell::new(None));
    let a = Channel::bounded(1);
    let b = Channel::bounded(1);

    {
        let outcome = Rc::clone(&outcome);
        let a = a.clone();
        let b = b.clone();
        ev.spawn(move |cx| async move {
            let got = cx
                .select(vec![
                    Clause::Give(a.clone(), "x"),
                    Clause::Give(b.clone(), "y"),
                ])
                .await?;
            *outcome.borrow_mut() = Some(got);
            Ok(())
        });
    }
    ev.run().expect("loop");

    assert_eq!(
        outcome.borrow_mut().take().expect("outcome"),
        SelectOutcome::Give(a.clone())
    );
    assert_eq!(a.len(), 1, "chosen clause deposited its value");
    assert_eq!(b.len(), 0, "losing clause was never performed");
}

#[test]
fn blocked_select_completes_when_a_counterparty_arrives() {
    init_test_logging();
    let ev: EvLoop<&'static str> = EvLoop::new().expect("loop");
    let outcome = Rc::new(RefCell::new(None));
    let a: Channel<&'static str> = Channel::bounded(1);
    let b: Channel<&'static str> = Channel::bounded(1);

    {
        let outcome = Rc::clone(&outcome);
        let a = a.clone();
        let b = b.clone();
        ev.spawn(move |cx| async move {
            let got = cx
                .select(vec![Clause::Take(a.clone()), Clause::Take(b.clone())])
                .await?;
            *outcome.borrow_mut() = Some(got);
            Ok(())
        });
    }
    ev.step().expect("step");
    assert_eq!(a.pending_readers(), 1);
    assert_eq!(b.pending_readers(), 1);

    {
        let b = b.clone();
        ev.spawn(move |cx| async move {
            cx.give(&b, "late").await?;
            Ok(())
        });
    }
    ev.run().expect("loop");

    assert_eq!(
        outcome.borrow_mut().take().expect("outcome"),
        SelectOutcome::Take(b.clone(), "late")
    );

    // The losing registration on `a` is stale: a later give must skip it
    // and buffer its value instead of waking the finished selector.
    {
        let a2 = a.clone();
        ev.spawn(move |cx| async move {
            cx.give(&a2, "unclaimed").await?;
            Ok(())
        });
    }
    ev.run().expect("loop");
    assert_eq!(a.len(), 1);
    assert_eq!(a.pending_readers(), 0);
}

#[test]
fn select_give_meets_a_parked_reader_immediately() {
    init_test_logging();
    let ev: EvLoop<&'static str> = EvLoop::new().expect("loop");
    let received = Rc::new(RefCell::new(None));
    let outcome = Rc::new(RefCell::new(None));
    let chan: Channel<&'static str> = Channel::rendezvous();

    {
        let received = Rc::clone(&received);
        let chan = chan.clone();
        ev.spawn(move |cx| async move {
            *received.borrow_mut() = Some(cx.take(&chan).await?);
            Ok(())
        });
    }
    ev.step().expect("step");
    assert_eq!(chan.pending_readers(), 1);

    {
        let outcome = Rc::clone(&outcome);
        let chan = chan.clone();
        ev.spawn(move |cx| async move {
            let got = cx.select(vec![Clause::Give(chan.clone(), "v")]).await?;
            *outcome.borrow_mut() = Some(got);
            Ok(())
        });
    }
    ev.run().expect("loop");

    assert_eq!(
        outcome.borrow_mut().take().expect("outcome"),
        SelectOutcome::Give(chan.clone()),
        "a waiting reader makes the give clause immediately ready",
    );
    assert_eq!(*received.borrow(), Some("v"));
    assert_eq!(chan.len(), 0, "the value went straight to the reader");
}

#[test]
fn select_with_no_clauses_is_a_contract_error() {
    init_test_logging();
    let ev: EvLoop<&'static str> = EvLoop::new().expect("loop");
    let observed = Rc::new(RefCell::new(None));

    {
        let observed = Rc::clone(&observed);
        ev.spawn(move |cx| async move {
            let err = cx.select(vec![]).await.expect_err("empty select must fail");
            *observed.borrow_mut() = Some(err);
            Ok(())
        });
    }
    ev.run().expect("loop");
    assert_eq!(
        observed.borrow_mut().take().expect("error").kind(),
        ErrorKind::Contract
    );
}

#[test]
fn rselect_reaches_both_outcome_kinds() {
    init_test_logging();
    let ev: EvLoop<&'static str> = EvLoop::new().expect("loop").with_seed(0x5EED);
    let tallies = Rc::new(RefCell::new((0u32, 0u32)));

    // `a` always has room for a give, `b` always has an item for a take, so
    // every iteration has both clauses ready and the shuffle decides.
    let a: Channel<&'static str> = Channel::bounded(1);
    let b: Channel<&'static str> = Channel::bounded(1);

    {
        let tallies = Rc::clone(&tallies);
        let a = a.clone();
        let b = b.clone();
        ev.spawn(move |cx| async move {
            cx.give(&b, "B").await?;
            for _ in 0..10_000 {
                let got = cx
                    .rselect(vec![
                        Clause::Give(a.clone(), "A"),
                        Clause::Take(b.clone()),
                    ])
                    .await?;
                match got {
                    SelectOutcome::Give(_) => {
                        tallies.borrow_mut().0 += 1;
                        let _ = cx.take(&a).await?;
                    }
                    SelectOutcome::Take(_, value) => {
                        tallies.borrow_mut().1 += 1;
                        cx.give(&b, value).await?;
                    }
                }
            }
            Ok(())
        });
    }
    ev.run().expect("loop");

    let (gives, takes) = *tallies.borrow();
    assert_eq!(gives + takes, 10_000);
    assert!(gives > 0, "randomized order must sometimes pick the give");
    assert!(takes > 0, "randomized order must sometimes pick the take");
}
