//! Sequential and shutdown-semantics checks, run against every reclamation
//! strategy.

use reclaim_queue::reclaim::{Epoch, Hazard, Leak, Reclaim};
use reclaim_queue::{MpmcQueue, MutexQueue};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One producer, three items, a close, and a full drain.
fn three_items_then_close<R: Reclaim>() {
    let q: MpmcQueue<(u32, u32), R> = MpmcQueue::new();
    q.push((0, 0)).unwrap();
    q.push((0, 1)).unwrap();
    q.push((0, 2)).unwrap();
    q.close();

    assert_eq!(q.pop(), Some((0, 0)));
    assert_eq!(q.pop(), Some((0, 1)));
    assert_eq!(q.pop(), Some((0, 2)));
    assert_eq!(q.pop(), None);
    assert!(q.is_closed());
    assert!(q.push((0, 3)).is_err());
    // Closed and drained stays closed and drained.
    assert_eq!(q.pop(), None);
}

#[test]
fn three_items_then_close_leak() {
    three_items_then_close::<Leak>();
}

#[test]
fn three_items_then_close_hazard() {
    three_items_then_close::<Hazard>();
}

#[test]
fn three_items_then_close_epoch() {
    three_items_then_close::<Epoch>();
}

fn single_thread_fifo<R: Reclaim>() {
    let q: MpmcQueue<u64, R> = MpmcQueue::new();
    for i in 0..1_000 {
        q.push(i).unwrap();
    }
    for i in 0..1_000 {
        assert_eq!(q.pop(), Some(i));
    }
    assert_eq!(q.pop(), None);
}

#[test]
fn single_thread_fifo_leak() {
    single_thread_fifo::<Leak>();
}

#[test]
fn single_thread_fifo_hazard() {
    single_thread_fifo::<Hazard>();
}

#[test]
fn single_thread_fifo_epoch() {
    single_thread_fifo::<Epoch>();
}

#[test]
fn close_is_idempotent_and_sticky() {
    let q: MpmcQueue<u8> = MpmcQueue::new();
    q.close();
    assert!(q.is_closed());
    q.close();
    assert!(q.is_closed());
    assert!(q.push(1).is_err());
}

#[test]
fn interleaved_push_pop_tracks_the_oracle() {
    // Same random operation sequence against the lock-free queue and the
    // trivially-correct locked queue; single-threaded, so the outputs must
    // match exactly.
    let subject: MpmcQueue<u32> = MpmcQueue::new();
    let oracle: MutexQueue<u32> = MutexQueue::new();

    let mut rng = StdRng::seed_from_u64(0xDECAF);
    let mut next = 0u32;
    for _ in 0..10_000 {
        if rng.gen_bool(0.6) {
            assert_eq!(subject.push(next).is_ok(), oracle.push(next).is_ok());
            next += 1;
        } else {
            assert_eq!(subject.pop(), oracle.pop());
        }
    }
    loop {
        let (a, b) = (subject.pop(), oracle.pop());
        assert_eq!(a, b);
        if a.is_none() {
            break;
        }
    }
}

#[test]
fn empty_queue_stays_empty_for_every_consumer() {
    // Zero producers, N consumers, immediate close.
    use crossbeam_utils::thread;

    let q: MpmcQueue<u64, Epoch> = MpmcQueue::new();
    q.close();
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|_| {
                for _ in 0..100 {
                    assert_eq!(q.pop(), None);
                    assert!(q.is_closed());
                }
            });
        }
    })
    .unwrap();
}

#[test]
fn dequeue_races_close_with_one_item_in_flight() {
    use crossbeam_utils::thread;

    for _ in 0..200 {
        let q: MpmcQueue<u64, Hazard> = MpmcQueue::new();
        q.push(7).unwrap();
        thread::scope(|scope| {
            let popper = scope.spawn(|_| {
                let mut got = None;
                while got.is_none() && !q.is_closed() {
                    got = q.pop();
                }
                // Whichever side the race lands on, the element must still
                // be obtainable exactly once.
                got.or_else(|| q.pop())
            });
            scope.spawn(|_| q.close());
            assert_eq!(popper.join().unwrap(), Some(7));
        })
        .unwrap();
    }
}

#[test]
fn values_survive_only_until_drop() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));

    // One producer, zero consumers: the destructor owns every element.
    let q: MpmcQueue<Tracked, Hazard> = MpmcQueue::new();
    for _ in 0..50 {
        q.push(Tracked(Arc::clone(&drops))).unwrap();
    }
    q.close();
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    drop(q);
    assert_eq!(drops.load(Ordering::Relaxed), 50);

    // Popped values are dropped by the consumer, not again by the queue.
    let drops2 = Arc::new(AtomicUsize::new(0));
    let q: MpmcQueue<Tracked, Epoch> = MpmcQueue::new();
    for _ in 0..10 {
        q.push(Tracked(Arc::clone(&drops2))).unwrap();
    }
    for _ in 0..4 {
        drop(q.pop());
    }
    assert_eq!(drops2.load(Ordering::Relaxed), 4);
    drop(q);
    assert_eq!(drops2.load(Ordering::Relaxed), 10);
}

#[test]
fn rejected_push_returns_the_value_intact() {
    let q: MpmcQueue<Vec<u8>> = MpmcQueue::new();
    q.close();
    let err = q.push(vec![1, 2, 3]).unwrap_err();
    assert_eq!(err.into_inner(), vec![1, 2, 3]);
}
