//! Serial monitor that shares a port with the bootloader protocol.
//!
//! A [`Monitor`] thread forwards everything the device prints while the port
//! is idle. Protocol operations take a [`ProtocolGuard`] from the port's
//! [`ModeGate`], which stops the monitor reading until the guard is dropped,
//! so no ACK or payload byte is ever consumed by the monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use embedded_hal::serial::{Read, Write};

use crate::SerialPort;

/// Most bytes forwarded in a single monitor message
pub const MONITOR_CHUNK: usize = 4096;

const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Mode {
    /// Incoming bytes belong to the monitor
    Monitor,
    /// A bootloader exchange owns the port
    Protocol,
}

#[derive(Debug, Default)]
struct GateState {
    depth: usize,
    draining: bool,
}

/// Arbitrates a serial port between the monitor and protocol operations
#[derive(Clone, Debug, Default)]
pub struct ModeGate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl ModeGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter protocol mode, waiting for any in-progress monitor read to finish.
    ///
    /// Guards nest, the gate returns to monitor mode when the last one drops.
    pub fn acquire(&self) -> ProtocolGuard {
        let mut state = self.lock();
        while state.draining {
            state = self.inner.1.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.depth += 1;

        ProtocolGuard { gate: self.clone() }
    }

    pub fn mode(&self) -> Mode {
        match self.lock().depth {
            0 => Mode::Monitor,
            _ => Mode::Protocol,
        }
    }

    /// Claim the port for a monitor read, fails while in protocol mode
    fn begin_drain(&self) -> bool {
        let mut state = self.lock();
        if state.depth > 0 {
            return false;
        }
        state.draining = true;
        true
    }

    fn end_drain(&self) {
        self.lock().draining = false;
        self.inner.1.notify_all();
    }

    fn release(&self) {
        let mut state = self.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            trace!("Returning port to monitor");
        }
        self.inner.1.notify_all();
    }
}

/// Holds the port in protocol mode, restores monitor mode on drop
/// (including on early return and unwinding)
#[derive(Debug)]
pub struct ProtocolGuard {
    gate: ModeGate,
}

impl Drop for ProtocolGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Port shared between a [`Programmer`](crate::Programmer) and a [`Monitor`]
pub struct Monitored<P> {
    port: Arc<Mutex<P>>,
    gate: ModeGate,
}

impl<P> Clone for Monitored<P> {
    fn clone(&self) -> Self {
        Self { port: self.port.clone(), gate: self.gate.clone() }
    }
}

impl<P> Monitored<P> {
    pub fn new(port: P) -> Self {
        Self { port: Arc::new(Mutex::new(port)), gate: ModeGate::new() }
    }

    pub fn mode_gate(&self) -> &ModeGate {
        &self.gate
    }

    fn lock(&self) -> MutexGuard<'_, P> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: Read<u8>> Read<u8> for Monitored<P> {
    type Error = P::Error;

    fn read(&mut self) -> nb::Result<u8, P::Error> {
        self.lock().read()
    }
}

impl<P: Write<u8>> Write<u8> for Monitored<P> {
    type Error = P::Error;

    fn write(&mut self, word: u8) -> nb::Result<(), P::Error> {
        self.lock().write(word)
    }

    fn flush(&mut self) -> nb::Result<(), P::Error> {
        self.lock().flush()
    }
}

impl<P, E> SerialPort<E> for Monitored<P>
where
    P: SerialPort<E>,
{
    fn set_rts(&mut self, level: bool) -> Result<(), E> {
        self.lock().set_rts(level)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), E> {
        self.lock().set_dtr(level)
    }

    fn gate(&self) -> Option<&ModeGate> {
        Some(&self.gate)
    }
}

/// Background reader forwarding idle serial output over a channel
pub struct Monitor {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Monitor {
    /// Start forwarding bytes from `port` to `tx` while the port is idle
    pub fn spawn<P>(port: Monitored<P>, tx: Sender<Vec<u8>>) -> Self
    where
        P: Read<u8> + Send + 'static,
        P::Error: core::fmt::Debug,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();

        let handle = thread::spawn(move || {
            debug!("Monitor started");

            while !stop_thread.load(Ordering::Relaxed) {
                if !port.gate.begin_drain() {
                    thread::sleep(IDLE_POLL);
                    continue;
                }

                let mut buff = Vec::new();
                let mut failed = false;
                {
                    let mut p = port.lock();
                    while buff.len() < MONITOR_CHUNK {
                        match p.read() {
                            Ok(b) => buff.push(b),
                            Err(nb::Error::WouldBlock) => break,
                            Err(nb::Error::Other(e)) => {
                                warn!("Monitor read error: {:?}", e);
                                failed = true;
                                break;
                            }
                        }
                    }
                }

                port.gate.end_drain();

                if !buff.is_empty() && tx.send(buff).is_err() {
                    debug!("Monitor receiver closed");
                    break;
                }

                if failed || port.gate.mode() == Mode::Monitor {
                    thread::sleep(IDLE_POLL);
                }
            }

            debug!("Monitor stopped");
        });

        Self { stop, handle: Some(handle) }
    }

    /// Stop the reader thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                error!("Monitor thread panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
