//! Ownership-protocol tests for the debug wrapper: the double-enqueue
//! scenario, and randomized mixed workloads checked verdict-for-verdict
//! against independent ownership oracles.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cleanq::backends::{DebugQueue, FfqQueue, Interval, LoopbackQueue};
use cleanq::shmem::{SharedMapping, ShmError};
use cleanq::{BufferDesc, CleanqError, MemRegion, RegionId};

const BUF_SIZE: u64 = 2048;

fn unique_path(name: &str) -> String {
    format!(
        "/cleanq-own-{}-{}-{}",
        name,
        std::process::id(),
        rand::random::<u32>()
    )
}

fn shm_available() -> bool {
    let path = unique_path("probe");
    match SharedMapping::<u64>::attach(&path, |_| {}) {
        Ok(_mapping) => true,
        Err(ShmError::PosixError { source, .. }) if source == rustix::io::Errno::ACCESS => {
            eprintln!("Skipping test due to shared memory permission denial");
            false
        }
        Err(err) => panic!("unexpected shared memory error: {err}"),
    }
}

fn buf(rid: RegionId, index: u64) -> BufferDesc {
    BufferDesc::covering(rid, index * BUF_SIZE, BUF_SIZE)
}

#[test]
fn double_enqueue_never_reaches_the_backend() {
    let mut q = DebugQueue::wrap(LoopbackQueue::create());
    let rid = q
        .register(MemRegion {
            vaddr: 0,
            paddr: 0x10_0000,
            len: 64 * BUF_SIZE,
        })
        .unwrap();

    q.enqueue(buf(rid, 0)).unwrap();
    assert_eq!(q.enqueue(buf(rid, 0)), Err(CleanqError::InvalidBufferArgs));

    // Exactly one descriptor made it through.
    assert_eq!(q.dequeue().unwrap().offset, 0);
    assert_eq!(q.dequeue(), Err(CleanqError::QueueEmpty));
}

/// Loopback + debug against a boolean ownership oracle: every verdict the
/// debug queue produces must match the oracle's simulation of ownership
/// transfer, over a long random schedule.
#[test]
fn randomized_workload_matches_oracle() {
    // More buffers than ring slots, so the oracle also exercises QueueFull.
    const NUM_BUFS: usize = 96;
    const ROUNDS: usize = 1_000_000;
    // Loopback ring capacity, which bounds in-flight descriptors.
    const RING_CAPACITY: usize = 64;

    let mut q = DebugQueue::wrap(LoopbackQueue::create());
    let rid = q
        .register(MemRegion {
            vaddr: 0,
            paddr: 0x20_0000,
            len: NUM_BUFS as u64 * BUF_SIZE,
        })
        .unwrap();

    let mut rng = StdRng::seed_from_u64(0x00c1_ea4c_0ffe_e5ed);
    let mut owned = [true; NUM_BUFS];
    let mut in_flight: VecDeque<usize> = VecDeque::new();

    for _ in 0..ROUNDS {
        if rng.gen_bool(0.5) {
            // Enqueue a random buffer, owned or not.
            let index = rng.gen_range(0..NUM_BUFS);
            let verdict = q.enqueue(buf(rid, index as u64));

            if !owned[index] {
                assert_eq!(verdict, Err(CleanqError::InvalidBufferArgs));
            } else if in_flight.len() == RING_CAPACITY {
                // Full ring: retriable, ownership unchanged.
                assert_eq!(verdict, Err(CleanqError::QueueFull));
            } else {
                assert_eq!(verdict, Ok(()));
                owned[index] = false;
                in_flight.push_back(index);
            }
        } else {
            let verdict = q.dequeue();
            match in_flight.pop_front() {
                None => assert_eq!(verdict, Err(CleanqError::QueueEmpty)),
                Some(expected) => {
                    let desc = verdict.expect("dequeue of an in-flight buffer");
                    assert_eq!(desc.offset, expected as u64 * BUF_SIZE);
                    owned[expected] = true;
                }
            }
        }
    }

    // Drain and verify conservation: ownership of every byte comes back.
    while let Some(expected) = in_flight.pop_front() {
        let desc = q.dequeue().unwrap();
        assert_eq!(desc.offset, expected as u64 * BUF_SIZE);
        owned[expected] = true;
    }
    assert!(owned.iter().all(|&o| o));
    assert_eq!(
        q.backend().free_intervals(rid).unwrap(),
        &[Interval {
            offset: 0,
            length: NUM_BUFS as u64 * BUF_SIZE,
        }]
    );
}

/// Two shared-memory endpoints, a debug wrapper on each side, an echoing
/// server, and an ownership oracle on the client. Ends by checking that the
/// intervals on both sides reconstruct the region's full extent.
#[test]
fn ffq_echo_workload_with_debug_on_both_sides() {
    const NUM_BUFS: usize = 32;
    const ROUNDS: usize = 20_000;

    if !shm_available() {
        return;
    }
    let path = unique_path("ffq-rand");
    let mut client = DebugQueue::wrap(FfqQueue::create(&path).expect("create"));
    let mut server = DebugQueue::wrap(FfqQueue::create(&path).expect("join"));

    let region_len = NUM_BUFS as u64 * BUF_SIZE;
    let rid = client
        .register(MemRegion {
            vaddr: 0x7f80_0000_0000,
            paddr: 0x30_0000,
            len: region_len,
        })
        .unwrap();

    let mut rng = StdRng::seed_from_u64(20_08_2002);
    let mut owned = [true; NUM_BUFS];
    let mut expected_returns: VecDeque<usize> = VecDeque::new();

    for _ in 0..ROUNDS {
        if rng.gen_bool(0.5) {
            let index = rng.gen_range(0..NUM_BUFS);
            let verdict = client.enqueue(buf(rid, index as u64));
            if owned[index] {
                // At most NUM_BUFS descriptors exist, which fits both
                // directions of the ring, so the send cannot hit QueueFull.
                assert_eq!(verdict, Ok(()));
                owned[index] = false;
                expected_returns.push_back(index);
            } else if owned.iter().all(|&o| !o) {
                // Nothing owned at all: the free list itself is empty.
                assert_eq!(verdict, Err(CleanqError::BufferAlreadyInUse));
            } else {
                assert_eq!(verdict, Err(CleanqError::InvalidBufferArgs));
            }
        } else {
            // Echo everything currently on the server side, then take one
            // return on the client side.
            loop {
                match server.dequeue() {
                    Ok(desc) => server.enqueue(desc).expect("server echo"),
                    Err(CleanqError::QueueEmpty) => break,
                    Err(err) => panic!("server dequeue failed: {err}"),
                }
            }

            match client.dequeue() {
                Ok(desc) => {
                    let expected = expected_returns.pop_front().expect("unexpected return");
                    assert_eq!(desc.offset, expected as u64 * BUF_SIZE);
                    owned[expected] = true;
                }
                Err(CleanqError::QueueEmpty) => {
                    // Nothing echoed yet this round.
                }
                Err(err) => panic!("client dequeue failed: {err}"),
            }
        }
    }

    // Drain the pipeline completely.
    loop {
        match server.dequeue() {
            Ok(desc) => server.enqueue(desc).expect("server echo"),
            Err(CleanqError::QueueEmpty) => break,
            Err(err) => panic!("server dequeue failed: {err}"),
        }
    }
    while let Some(expected) = expected_returns.pop_front() {
        let desc = client.dequeue().expect("drain");
        assert_eq!(desc.offset, expected as u64 * BUF_SIZE);
        owned[expected] = true;
    }
    assert!(owned.iter().all(|&o| o));

    // Conservation on both shadows: the client owns the whole region again
    // and the server holds nothing.
    assert_eq!(
        client.backend().free_intervals(rid).unwrap(),
        &[Interval {
            offset: 0,
            length: region_len,
        }]
    );
    assert_eq!(server.backend().free_intervals(rid).unwrap(), &[]);
}
