use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Hands out exclusive `(listen, control)` port pairs from a fixed range.
/// A pair is reserved until its [`PortLease`] is dropped.
#[derive(Clone)]
pub struct PortPool {
    inner: Arc<Mutex<PoolState>>,
}

struct PoolState {
    base: u16,
    slots: u16,
    in_use: BTreeSet<u16>,
}

impl PortPool {
    pub fn new(base: u16, span: u16) -> Self {
        let span = span.min(u16::MAX - base);
        Self {
            inner: Arc::new(Mutex::new(PoolState { base, slots: span / 2, in_use: BTreeSet::new() })),
        }
    }

    /// Reserves the first free pair whose ports can currently be bound.
    pub fn lease(&self) -> Result<PortLease> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (base, slots) = (state.base, state.slots);

        for slot in 0..slots {
            if state.in_use.contains(&slot) {
                continue;
            }
            let listen = base + slot * 2;
            let control = listen + 1;
            if !bindable(listen) || !bindable(control) {
                continue;
            }
            state.in_use.insert(slot);
            return Ok(PortLease { listen, control, slot, pool: self.inner.clone() });
        }

        Err(Error::PortsExhausted(base, base + slots * 2))
    }

    #[cfg(test)]
    pub fn leased(&self) -> usize {
        self.inner.lock().map(|s| s.in_use.len()).unwrap_or(0)
    }
}

fn bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[derive(Debug)]
pub struct PortLease {
    pub listen: u16,
    pub control: u16,
    slot: u16,
    pool: Arc<Mutex<PoolState>>,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Ok(mut state) = self.pool.lock() {
            state.in_use.remove(&self.slot);
        }
    }
}

impl std::fmt::Debug for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolState")
            .field("base", &self.base)
            .field("in_use", &self.in_use.len())
            .finish()
    }
}
