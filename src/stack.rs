//! Wires the layers together and runs them.

use crate::network::FrameType;
use crate::protocols::arp::Arp;
use crate::protocols::ipv4::{Iface, IpError, Ipv4, Ipv4Address};
use crate::protocols::tcp::{Iss, Tcp};
use crate::network::Device;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often the driver thread polls the devices for received frames.
const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// The base timer period; the retransmission scan runs every tick.
const TIMER_INTERVAL: Duration = Duration::from_millis(100);
/// The user-timeout, TIME-WAIT, and ARP aging scans run every this many
/// base ticks.
const SLOW_TICKS: u32 = 10;

/// One stack instance: the ARP, IPv4, and TCP layers plus the background
/// threads that drive them.
///
/// Two threads run while the stack does: a driver thread that polls every
/// interface's device and delivers received frames upward, and a timer
/// thread that fires the periodic TCP and ARP scans. [`Stack::shut_down`]
/// stops both and interrupts every blocked TCP caller.
pub struct Stack {
    arp: Arc<Arp>,
    ip: Arc<Ipv4>,
    tcp: Arc<Tcp>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    /// Builds a stack and registers TCP in the IP demultiplex registry.
    pub fn new(iss: Iss) -> Result<Arc<Self>, IpError> {
        let arp = Arc::new(Arp::new());
        let ip = Arc::new(Ipv4::new(arp.clone()));
        let tcp = Tcp::new(ip.clone(), iss);
        ip.register_protocol(Tcp::PROTOCOL, tcp.clone())?;
        Ok(Arc::new(Self {
            arp,
            ip,
            tcp,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }))
    }

    pub fn ip(&self) -> &Arc<Ipv4> {
        &self.ip
    }

    pub fn tcp(&self) -> &Arc<Tcp> {
        &self.tcp
    }

    pub fn arp(&self) -> &Arc<Arp> {
        &self.arp
    }

    /// Binds an interface to a device. See [`Ipv4::add_iface`].
    pub fn add_iface(
        &self,
        device: Arc<dyn Device>,
        unicast: Ipv4Address,
        netmask: Ipv4Address,
    ) -> Arc<Iface> {
        self.ip.add_iface(device, unicast, netmask)
    }

    /// Starts the driver and timer threads. Calling it twice is a no-op.
    pub fn run(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.threads.lock().unwrap();

        let driver = {
            let stack = self.clone();
            std::thread::spawn(move || {
                while stack.running.load(Ordering::SeqCst) {
                    let mut delivered = false;
                    for iface in stack.ip.ifaces() {
                        while let Some((frame, data)) = iface.device.poll() {
                            delivered = true;
                            match frame {
                                FrameType::Ipv4 => stack.ip.input(&data, &iface),
                                FrameType::Arp => stack.arp.input(&data, &iface),
                            }
                        }
                    }
                    if !delivered {
                        std::thread::sleep(POLL_INTERVAL);
                    }
                }
            })
        };
        threads.push(driver);

        let timer = {
            let stack = self.clone();
            std::thread::spawn(move || {
                let mut ticks = 0u32;
                while stack.running.load(Ordering::SeqCst) {
                    std::thread::sleep(TIMER_INTERVAL);
                    let now = Instant::now();
                    stack.tcp.retransmit_tick(now);
                    ticks = ticks.wrapping_add(1);
                    if ticks % SLOW_TICKS == 0 {
                        stack.tcp.user_timeout_tick(now);
                        stack.tcp.time_wait_tick(now);
                        stack.arp.age_tick(now);
                    }
                }
            })
        };
        threads.push(timer);
    }

    /// Stops the background threads and interrupts every blocked caller,
    /// which unwinds with an interrupted error and releases its
    /// connection.
    pub fn shut_down(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.tcp.interrupt_all();
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for thread in threads {
            let _ = thread.join();
        }
    }
}
