//! Channel semantics end to end: rendezvous hand-off, bounded
//! backpressure, and the one-in-flight behavior of limit-zero channels.

use fiberloop::test_utils::init_test_logging;
use fiberloop::{Channel, EvLoop};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn rendezvous_delivers_before_the_sender_resumes() {
    init_test_logging();
    let ev: EvLoop<i64> = EvLoop::new().expect("loop");
    let log = Rc::new(RefCell::new(Vec::new()));
    let chan = Channel::rendezvous();

    {
        let log = Rc::clone(&log);
        let chan = chan.clone();
        ev.spawn(move |cx| async move {
            cx.give(&chan, 42).await?;
            log.borrow_mut().push("sent".to_string());
            Ok(())
        });
    }
    {
        let log = Rc::clone(&log);
        let chan = chan.clone();
        ev.spawn(move |cx| async move {
            let value = cx.take(&chan).await?;
            log.borrow_mut().push(value.to_string());
            Ok(())
        });
    }

    ev.run().expect("loop");
    assert_eq!(*log.borrow(), vec!["42", "sent"]);
}

#[test]
fn bounded_channel_applies_backpressure() {
    init_test_logging();
    let ev: EvLoop<i64> = EvLoop::new().expect("loop");
    let log = Rc::new(RefCell::new(Vec::new()));
    let taken = Rc::new(RefCell::new(Vec::new()));
    let chan = Channel::bounded(1);

    {
        let log = Rc::clone(&log);
        let chan = chan.clone();
        ev.spawn(move |cx| async move {
            for i in 1..=4 {
                cx.give(&chan, i).await?;
                log.borrow_mut().push(format!("sent {i}"));
            }
            Ok(())
        });
    }
    {
        let log = Rc::clone(&log);
        let taken = Rc::clone(&taken);
        let chan = chan.clone();
        ev.spawn(move |cx| async move {
            for _ in 0..4 {
                let value = cx.take(&chan).await?;
                log.borrow_mut().push(format!("got {value}"));
                taken.borrow_mut().push(value);
            }
            Ok(())
        });
    }

    ev.run().expect("loop");
    assert_eq!(*taken.borrow(), vec![1, 2, 3, 4]);
    // The sender suspends exactly twice: once over the limit after 2, once
    // after 4. Everything else interleaves deterministically.
    assert_eq!(
        *log.borrow(),
        vec![
            "sent 1", "got 1", "sent 2", "sent 3", "got 2", "got 3", "sent 4", "got 4",
        ]
    );
}

#[test]
fn limit_zero_admits_one_value_in_flight() {
    init_test_logging();
    let ev: EvLoop<i64> = EvLoop::new().expect("loop");
    let chan: Channel<i64> = Channel::rendezvous();

    {
        let chan = chan.clone();
        ev.spawn(move |cx| async move {
            cx.give(&chan, 7).await?;
            Ok(())
        });
    }

    // One pass: the sender deposits its value and suspends.
    ev.step().expect("step");
    assert_eq!(chan.len(), 1, "value is in flight while the sender blocks");
    assert_eq!(chan.pending_writers(), 1);
    assert!(chan.is_full());

    // A receiver drains the value and releases the sender.
    let got = Rc::new(RefCell::new(None));
    {
        let got = Rc::clone(&got);
        let chan = chan.clone();
        ev.spawn(move |cx| async move {
            *got.borrow_mut() = Some(cx.take(&chan).await?);
            Ok(())
        });
    }
    ev.run().expect("loop");
    assert_eq!(*got.borrow(), Some(7));
    assert_eq!(chan.len(), 0);
    assert_eq!(chan.pending_writers(), 0);
}

#[test]
fn give_without_contention_does_not_suspend_the_loop() {
    init_test_logging();
    let ev: EvLoop<i64> = EvLoop::new().expect("loop");
    let chan = Channel::bounded(4);
    let sent = Rc::new(RefCell::new(0));

    {
        let chan = chan.clone();
        let sent = Rc::clone(&sent);
        ev.spawn(move |cx| async move {
            for i in 0..4 {
                cx.give(&chan, i).await?;
                *sent.borrow_mut() += 1;
            }
            Ok(())
        });
    }
    ev.run().expect("loop");
    assert_eq!(*sent.borrow(), 4);
    assert_eq!(chan.len(), 4);
    assert!(chan.is_full());
}

#[test]
fn take_pairs_with_the_oldest_live_writer() {
    init_test_logging();
    let ev: EvLoop<i64> = EvLoop::new().expect("loop");
    let chan = Channel::bounded(0);
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 1..=3 {
        let chan = chan.clone();
        let order = Rc::clone(&order);
        ev.spawn(move |cx| async move {
            cx.give(&chan, i).await?;
            order.borrow_mut().push(format!("writer {i} released"));
            Ok(())
        });
    }
    {
        let chan = chan.clone();
        let order = Rc::clone(&order);
        ev.spawn(move |cx| async move {
            for _ in 0..3 {
                let v = cx.take(&chan).await?;
                order.borrow_mut().push(format!("took {v}"));
            }
            Ok(())
        });
    }

    ev.run().expect("loop");
    let entries = order.borrow().clone();
    // Values arrive in send order and writers are released oldest first.
    let takes: Vec<&str> = entries
        .iter()
        .map(String::as_str)
        .filter(|e| e.starts_with("took"))
        .collect();
    assert_eq!(takes, vec!["took 1", "took 2", "took 3"]);
    let releases: Vec<&str> = entries
        .iter()
        .map(String::as_str)
        .filter(|e| e.starts_with("writer"))
        .collect();
    assert_eq!(
        releases,
        vec![
            "writer 1 released",
            "writer 2 released",
            "writer 3 released",
        ]
    );
}

#[test]
fn cancelled_reader_is_skipped_by_the_next_give() {
    init_test_logging();
    let ev: EvLoop<i64> = EvLoop::new().expect("loop");
    let chan: Channel<i64> = Channel::bounded(1);
    let got = Rc::new(RefCell::new(Vec::new()));

    let reader = {
        let chan = chan.clone();
        let got = Rc::clone(&got);
        ev.spawn(move |cx| async move {
            match cx.take(&chan).await {
                Ok(v) => got.borrow_mut().push(Ok(v)),
                Err(e) => got.borrow_mut().push(Err(e.to_string())),
            }
            Ok(())
        })
    };
    ev.step().expect("step");
    assert_eq!(chan.pending_readers(), 1);

    // Cancel the parked reader, then send. The stale reader entry must be
    // skipped and the value buffered instead of delivered to a ghost.
    ev.cancel(reader, "abandoned");
    {
        let chan2 = chan.clone();
        ev.spawn(move |cx| async move {
            cx.give(&chan2, 9).await?;
            Ok(())
        });
    }
    ev.run().expect("loop");

    assert_eq!(*got.borrow(), vec![Err("abandoned".to_string())]);
    assert_eq!(chan.len(), 1, "value stayed buffered");
    assert_eq!(chan.pending_readers(), 0, "stale entry was dropped");
}
