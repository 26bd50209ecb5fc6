//! A user-space TCP/IPv4 protocol stack.
//!
//! The whole stack runs in one address space: virtual network
//! [devices](network::Device) carry datagrams, the [IPv4
//! layer](protocols::ipv4::Ipv4) routes and demultiplexes them, and the
//! [TCP layer](protocols::tcp::Tcp) exposes a blocking, socket-like command
//! surface — `open`, `close`, `send`, `receive` — to application threads.
//!
//! # Organization
//!
//! - [`network`] defines the device contract plus the loopback and dummy
//!   drivers
//! - [`protocols`] holds ARP, IPv4, and TCP
//! - [`Stack`] wires the layers together and runs the driver and timer
//!   threads
//!
//! # Concurrency
//!
//! TCP's control blocks live in a fixed table behind a single mutex.
//! Blocking user calls sleep on a per-connection wait context that releases
//! the mutex while they wait; segment arrival and the timers run one state
//! machine step at a time under the same mutex. See the [`protocols::tcp`]
//! module documentation for details.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usernet::{Endpoint, Iss, Stack};
//! use usernet::network::loopback::Loopback;
//!
//! let stack = Stack::new(Iss::Random).unwrap();
//! stack.add_iface(
//!     Arc::new(Loopback::new()),
//!     "127.0.0.1".parse().unwrap(),
//!     "255.0.0.0".parse().unwrap(),
//! );
//! stack.run();
//!
//! let server = {
//!     let stack = stack.clone();
//!     std::thread::spawn(move || {
//!         let local = Endpoint::new("127.0.0.1".parse().unwrap(), 7);
//!         let id = stack.tcp().open(local, None, false).unwrap();
//!         let mut buf = [0; 128];
//!         let n = stack.tcp().receive(id, &mut buf).unwrap();
//!         stack.tcp().send(id, &buf[..n]).unwrap();
//!     })
//! };
//!
//! let local = Endpoint::new("127.0.0.1".parse().unwrap(), 40000);
//! let foreign = Endpoint::new("127.0.0.1".parse().unwrap(), 7);
//! let id = stack.tcp().open(local, Some(foreign), true).unwrap();
//! stack.tcp().send(id, b"ping").unwrap();
//! let mut buf = [0; 128];
//! let n = stack.tcp().receive(id, &mut buf).unwrap();
//! assert_eq!(&buf[..n], b"ping");
//! server.join().unwrap();
//! ```

pub mod network;
pub mod protocols;

mod stack;
pub use stack::Stack;

mod sync;

pub use protocols::ipv4::{Iface, Ipv4, Ipv4Address};
pub use protocols::tcp::{Iss, Tcp, TcpError};
pub use protocols::utility::Endpoint;
