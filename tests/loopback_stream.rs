//! End-to-end exercises of the blocking socket surface over the loopback
//! device, with the driver and timer threads running for real.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use usernet::network::loopback::Loopback;
use usernet::{Endpoint, Iss, Stack, TcpError};

fn loopback_stack(seed: u64) -> Arc<Stack> {
    let stack = Stack::new(Iss::FromSeed(seed)).unwrap();
    stack.add_iface(
        Arc::new(Loopback::new()),
        "127.0.0.1".parse().unwrap(),
        "255.0.0.0".parse().unwrap(),
    );
    stack.run();
    stack
}

fn endpoint(port: u16) -> Endpoint {
    Endpoint::new("127.0.0.1".parse().unwrap(), port)
}

/// Connects with a little patience: the listening thread may not have
/// reached LISTEN yet, in which case the first SYN draws a reset.
fn connect(stack: &Arc<Stack>, local: Endpoint, foreign: Endpoint) -> usize {
    let mut last = TcpError::Unreachable;
    for _ in 0..50 {
        match stack.tcp().open(local, Some(foreign), true) {
            Ok(id) => return id,
            Err(e) => {
                last = e;
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
    panic!("could not connect: {last}");
}

#[test]
fn echo_over_loopback() {
    let stack = loopback_stack(7);

    let server = {
        let stack = stack.clone();
        thread::spawn(move || -> anyhow::Result<()> {
            let id = stack.tcp().open(endpoint(7), None, false)?;
            let mut buf = [0u8; 2048];
            loop {
                let n = stack.tcp().receive(id, &mut buf)?;
                if n == 0 {
                    break;
                }
                let mut sent = 0;
                while sent < n {
                    sent += stack.tcp().send(id, &buf[sent..n])?;
                }
            }
            stack.tcp().close(id)?;
            Ok(())
        })
    };

    let id = connect(&stack, endpoint(40000), endpoint(7));

    let message: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(stack.tcp().send(id, &message).unwrap(), message.len());

    let mut echoed = Vec::new();
    let mut buf = [0u8; 512];
    while echoed.len() < message.len() {
        let n = stack.tcp().receive(id, &mut buf).unwrap();
        assert!(n > 0, "the echo stream ended early");
        echoed.extend_from_slice(&buf[..n]);
    }
    assert_eq!(echoed, message);

    // Our close reaches the server as end of stream; its close in turn
    // finishes the four-way teardown
    stack.tcp().close(id).unwrap();
    server.join().unwrap().unwrap();

    stack.shut_down();
}

#[test]
fn concurrent_connections_stay_separate() {
    let stack = loopback_stack(8);

    let make_server = |port: u16| {
        let stack = stack.clone();
        thread::spawn(move || -> anyhow::Result<Vec<u8>> {
            let id = stack.tcp().open(endpoint(port), None, false)?;
            let mut collected = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                let n = stack.tcp().receive(id, &mut buf)?;
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            Ok(collected)
        })
    };
    let first = make_server(7001);
    let second = make_server(7002);

    let a = connect(&stack, endpoint(41000), endpoint(7001));
    let b = connect(&stack, endpoint(41001), endpoint(7002));

    stack.tcp().send(a, b"to the first server").unwrap();
    stack.tcp().send(b, b"to the second server").unwrap();
    stack.tcp().close(a).unwrap();
    stack.tcp().close(b).unwrap();

    assert_eq!(first.join().unwrap().unwrap(), b"to the first server");
    assert_eq!(second.join().unwrap().unwrap(), b"to the second server");

    stack.shut_down();
}

#[test]
fn shutdown_interrupts_blocked_calls() {
    let stack = loopback_stack(9);

    let listener = {
        let stack = stack.clone();
        thread::spawn(move || stack.tcp().open(endpoint(9), None, false))
    };

    // Let the listener settle into its wait before pulling the plug
    thread::sleep(Duration::from_millis(100));
    stack.shut_down();

    assert_eq!(listener.join().unwrap(), Err(TcpError::Interrupted));
}
