//! End-to-end scenarios driving a real `CpuSet` on background OS threads.

use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::mpsc;
use std::time::Duration;

use corerun::cpu::CpuSet;

#[test]
fn single_cpu_schedules_a_task_and_observes_its_result() {
    let mut set = CpuSet::builder().add_pack(1).build().expect("build cpu set");
    let cpu = set.cpu(0).clone();

    let (tx, rx) = mpsc::channel();
    cpu.spawn(move || {
        let handle = corerun::CpuHandle::current().expect("running on a cpu");
        let future = handle.schedule(|| 2 + 2);
        let _ = future.on_success(move |v| {
            let _ = tx.send(v);
        });
    });

    let result = rx.recv_timeout(Duration::from_secs(2)).expect("task completed");
    assert_eq!(result, 4);

    set.halt();
}

#[test]
fn halting_an_idle_cpu_set_returns_promptly() {
    let mut set = CpuSet::builder().add_pack(2).build().expect("build cpu set");
    set.halt();
}

/// S4-flavored: a future still waiting on the timer wheel when the CPU set
/// halts must be failed with `Error::Shutdown`, not silently dropped with
/// the thread.
#[test]
fn halting_mid_sleep_fails_the_pending_future_with_shutdown() {
    let mut set = CpuSet::builder().add_pack(1).build().expect("build cpu set");
    let cpu = set.cpu(0).clone();

    let (installed_tx, installed_rx) = mpsc::channel();
    let (outcome_tx, outcome_rx) = mpsc::channel();
    cpu.spawn(move || {
        let future = corerun::cpu::sleep(Duration::from_secs(60), || ());
        let outcome_tx2 = outcome_tx.clone();
        let _ = future.on_success(move |_| {
            let _ = outcome_tx.send("resolved".to_string());
        });
        let _ = future.on_failure(move |e| {
            let _ = outcome_tx2.send(e.to_string());
        });
        let _ = installed_tx.send(());
    });

    installed_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("sleep installed before halt");
    set.halt();

    let outcome = outcome_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("sleeping future settled on shutdown");
    assert_eq!(outcome, corerun::Error::Shutdown.to_string());
}

/// S2: a listener reads a 4-byte length `L` then `L / 4` big-endian
/// integers, replying with their 4-byte big-endian sum, handling any number
/// of requests per connection.
#[test]
fn echo_sum_service_sums_each_length_prefixed_frame() {
    let mut set = CpuSet::builder().add_pack(1).build().expect("build cpu set");
    let pack = set.pack(0).clone();
    let cpu = set.cpu(0).clone();

    let (addr_tx, addr_rx) = mpsc::channel();
    cpu.spawn(move || {
        let addr = corerun::cpu::listen(
            "127.0.0.1:0".parse().unwrap(),
            pack,
            move |channel: corerun::Channel| {
                let ch = Rc::new(channel);
                let _ = corerun::cpu::repeat(move || {
                    let ch2 = ch.clone();
                    let ch3 = ch.clone();
                    ch.input
                        .read_int()
                        .expect("install length reader")
                        .flat_map(move |len: i32| {
                            ch2.input
                                .read_exact(len as usize)
                                .expect("install payload reader")
                        })
                        .map(move |mut buf: corerun::Buffer| {
                            let mut sum = 0i32;
                            while !buf.is_empty() {
                                sum = sum.wrapping_add(buf.read_i32());
                            }
                            ch3.output.write_int(sum);
                            corerun::cpu::Status::Continue::<()>
                        })
                });
            },
            |_e| {},
        )
        .expect("listen");
        let _ = addr_tx.send(addr);
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(2)).expect("listener bound");
    let mut stream = std::net::TcpStream::connect(addr).expect("connect to echo-sum service");

    for i in 0..10i32 {
        let values = [i, i + 1, i + 2];
        let mut frame = Vec::new();
        frame.extend_from_slice(&12i32.to_be_bytes());
        for v in values {
            frame.extend_from_slice(&v.to_be_bytes());
        }
        stream.write_all(&frame).expect("write request frame");

        let mut resp = [0u8; 4];
        stream.read_exact(&mut resp).expect("read response");
        assert_eq!(i32::from_be_bytes(resp), 3 * i + 3);
    }

    set.halt();
}

/// S3: a length-prefixed frame arriving across many small, independently
/// flushed writes (with a short pause between each) must still reassemble
/// correctly, exercising both `Continue`-driven re-polling and read-buffer
/// compaction for the fragments already consumed.
#[test]
fn fragmented_length_prefixed_frame_is_reassembled_and_echoed() {
    let mut set = CpuSet::builder().add_pack(1).build().expect("build cpu set");
    let pack = set.pack(0).clone();
    let cpu = set.cpu(0).clone();

    let (addr_tx, addr_rx) = mpsc::channel();
    cpu.spawn(move || {
        let addr = corerun::cpu::listen(
            "127.0.0.1:0".parse().unwrap(),
            pack,
            move |channel: corerun::Channel| {
                let ch = Rc::new(channel);
                let _ = corerun::cpu::repeat(move || {
                    let ch2 = ch.clone();
                    let ch3 = ch.clone();
                    ch.input
                        .read_int()
                        .expect("install length reader")
                        .flat_map(move |len: i32| {
                            ch2.input
                                .read_exact(len as usize)
                                .expect("install payload reader")
                        })
                        .map(move |buf: corerun::Buffer| {
                            ch3.output.write_int(buf.len() as i32);
                            ch3.output.write_bytes(&buf);
                            corerun::cpu::Status::Continue::<()>
                        })
                });
            },
            |_e| {},
        )
        .expect("listen");
        let _ = addr_tx.send(addr);
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(2)).expect("listener bound");
    let payload: Vec<u8> = (0u8..=200).collect();

    let mut stream = std::net::TcpStream::connect(addr).expect("connect");
    stream
        .write_all(&(payload.len() as i32).to_be_bytes())
        .expect("write length prefix");
    stream.flush().expect("flush length prefix");
    for chunk in payload.chunks(7) {
        stream.write_all(chunk).expect("write fragment");
        stream.flush().expect("flush fragment");
        std::thread::sleep(Duration::from_micros(100));
    }

    let mut expected = Vec::new();
    expected.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    expected.extend_from_slice(&payload);

    let mut response = vec![0u8; expected.len()];
    stream.read_exact(&mut response).expect("read echoed frame");
    assert_eq!(response, expected);

    set.halt();
}

/// S5: `sequence` over a mix of same-CPU and cross-CPU futures resolves in
/// input order regardless of completion order.
#[test]
fn sequence_resolves_local_and_cross_cpu_futures_in_order() {
    let mut set = CpuSet::builder().add_pack(3).build().expect("build cpu set");
    let cpu0 = set.cpu(0).clone();
    let cpu2 = set.cpu(2).clone();

    let (tx, rx) = mpsc::channel();
    cpu0.spawn(move || {
        let handle = corerun::CpuHandle::current().expect("running on a cpu");
        let futures: Vec<corerun::Future<i32>> = (0..5)
            .map(|i| {
                if i % 2 == 0 {
                    handle.schedule(move || i)
                } else {
                    cpu2.schedule(move || i)
                }
            })
            .collect();
        let seq = corerun::cpu::sequence(futures);
        let _ = seq.on_success(move |values| {
            let _ = tx.send(values);
        });
    });

    let values = rx.recv_timeout(Duration::from_secs(2)).expect("sequence resolved");
    assert_eq!(values, vec![0, 1, 2, 3, 4]);

    set.halt();
}

/// S6: as above, but one input future fails; the aggregate must surface
/// that failure instead of the successful values.
#[test]
fn sequence_with_one_failing_future_fails_with_that_error() {
    let mut set = CpuSet::builder().add_pack(3).build().expect("build cpu set");
    let cpu0 = set.cpu(0).clone();
    let cpu2 = set.cpu(2).clone();

    let (tx, rx) = mpsc::channel();
    cpu0.spawn(move || {
        let handle = corerun::CpuHandle::current().expect("running on a cpu");
        let futures: Vec<corerun::Future<i32>> = (0..5)
            .map(|i| {
                if i == 1 {
                    handle.schedule(move || panic!("illegal argument at index {i}"))
                } else if i % 2 == 0 {
                    handle.schedule(move || i)
                } else {
                    cpu2.schedule(move || i)
                }
            })
            .collect();
        let seq = corerun::cpu::sequence(futures);
        let _ = seq.on_failure(move |e| {
            let _ = tx.send(e.to_string());
        });
    });

    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("sequence failed");
    assert_eq!(outcome, corerun::Error::Invariant("task panicked").to_string());

    set.halt();
}
