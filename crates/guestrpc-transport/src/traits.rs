use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::regs::Registers;

/// The raw transport primitive.
///
/// Every call is synchronous and blocks the calling thread until the
/// counterpart has processed it. Implementations own the non-portable part
/// of a call (magic, port number, addresses); callers fill in everything
/// else.
pub trait Backdoor: Send {
    /// Low-bandwidth exchange of the register block.
    fn exchange(&mut self, regs: Registers) -> Registers;

    /// High-bandwidth copy of `payload` from the guest to the counterpart.
    ///
    /// The implementation sets `cx` to the length and `si` to the source
    /// address.
    fn bulk_send(&mut self, regs: Registers, payload: &[u8]) -> Registers;

    /// High-bandwidth copy from the counterpart into `buf`.
    ///
    /// The implementation sets `cx` to the length and `di` to the
    /// destination address.
    fn bulk_receive(&mut self, regs: Registers, buf: &mut [u8]) -> Registers;
}

impl<B: Backdoor + ?Sized> Backdoor for Box<B> {
    fn exchange(&mut self, regs: Registers) -> Registers {
        (**self).exchange(regs)
    }

    fn bulk_send(&mut self, regs: Registers, payload: &[u8]) -> Registers {
        (**self).bulk_send(regs, payload)
    }

    fn bulk_receive(&mut self, regs: Registers, buf: &mut [u8]) -> Registers {
        (**self).bulk_receive(regs, buf)
    }
}

/// Shared handle to the single physical transport.
///
/// The transport is one global resource: all channels in the process go
/// through the same handle, and [`Transport::lock`] serializes them.
pub struct Transport<B: ?Sized> {
    inner: Arc<Mutex<B>>,
}

/// Exclusive access to the transport for the duration of one operation.
pub type TransportGuard<'a, B> = MutexGuard<'a, B>;

impl<B: Backdoor> Transport<B> {
    /// Wrap a backdoor implementation in a shareable handle.
    pub fn new(backdoor: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(backdoor)),
        }
    }

    /// Erase the backdoor type. The result shares the same lock as `self`.
    pub fn into_dyn(self) -> Transport<dyn Backdoor>
    where
        B: 'static,
    {
        let inner: Arc<Mutex<dyn Backdoor>> = self.inner;
        Transport { inner }
    }
}

impl<B: Backdoor + ?Sized> Transport<B> {
    /// Acquire exclusive access to the transport.
    ///
    /// A poisoned lock is recovered: an exchange either happened or it did
    /// not, so a panicking holder leaves nothing half-written.
    pub fn lock(&self) -> TransportGuard<'_, B> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `other` is a handle to the same transport.
    pub fn same_as<C: ?Sized>(&self, other: &Transport<C>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }
}

impl<B: ?Sized> Clone for Transport<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ?Sized> fmt::Debug for Transport<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::regs::Register;

    #[derive(Default)]
    struct Counter {
        calls: usize,
        in_flight: bool,
    }

    impl Backdoor for Counter {
        fn exchange(&mut self, mut regs: Registers) -> Registers {
            assert!(!self.in_flight, "exchanges must not overlap");
            self.in_flight = true;
            self.calls += 1;
            regs.bx = Register::from_quad(self.calls as u64);
            self.in_flight = false;
            regs
        }

        fn bulk_send(&mut self, regs: Registers, _payload: &[u8]) -> Registers {
            regs
        }

        fn bulk_receive(&mut self, regs: Registers, _buf: &mut [u8]) -> Registers {
            regs
        }
    }

    #[test]
    fn clones_share_one_backdoor() {
        let transport = Transport::new(Counter::default());
        let other = transport.clone();

        transport.lock().exchange(Registers::default());
        other.lock().exchange(Registers::default());

        assert_eq!(transport.lock().calls, 2);
    }

    #[test]
    fn concurrent_callers_are_serialized() {
        let transport = Transport::new(Counter::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let transport = transport.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut guard = transport.lock();
                        guard.exchange(Registers::default());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(transport.lock().calls, 800);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let transport = Transport::new(Counter::default());
        let poisoner = transport.clone();

        let _ = thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("holder panics");
        })
        .join();

        let out = transport.lock().exchange(Registers::default());
        assert_eq!(out.bx.quad(), 1);
    }

    #[test]
    fn erased_transport_shares_lock() {
        let transport = Transport::new(Counter::default());
        let erased = transport.clone().into_dyn();

        erased.lock().exchange(Registers::default());
        transport.lock().exchange(Registers::default());
        let out = erased.lock().exchange(Registers::default());

        assert_eq!(out.bx.quad(), 3);
        assert_eq!(transport.lock().calls, 3);
        assert!(erased.same_as(&transport));
        assert!(!erased.same_as(&Transport::new(Counter::default())));
    }

    #[test]
    fn boxed_backdoor_forwards() {
        let mut boxed: Box<dyn Backdoor> = Box::new(Counter::default());
        let out = boxed.exchange(Registers::default());
        assert_eq!(out.bx.quad(), 1);
    }
}
