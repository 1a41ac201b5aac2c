use core::{future::poll_fn, task::Poll};

use portable_atomic::{AtomicU32, Ordering};

use atomic_waker::AtomicWaker;

/// A word of notification bits, which can be set from interrupt context and awaited by a task.
///
/// This is the equivalent of an RTOS task notification: setting bits never blocks and bits set
/// multiple times before the task gets to run are coalesced.
pub struct NotifyBits {
    bits: AtomicU32,
    waker: AtomicWaker,
}
impl NotifyBits {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            waker: AtomicWaker::new(),
        }
    }
    /// Set the specified bits and wake the waiting task.
    ///
    /// This is safe to call from an ISR.
    pub fn signal(&self, bits: u32) {
        self.bits.fetch_or(bits, Ordering::Release);
        self.waker.wake();
    }
    /// Take all currently set bits, clearing them.
    pub fn take(&self) -> u32 {
        self.bits.swap(0, Ordering::Acquire)
    }
    /// Clear all bits without waking anybody.
    pub fn reset(&self) {
        self.bits.store(0, Ordering::Relaxed);
    }
    /// Asynchronously wait for at least one bit to be set, then take all of them.
    pub async fn wait(&self) -> u32 {
        poll_fn(|cx| {
            let bits = self.take();
            if bits != 0 {
                return Poll::Ready(bits);
            }
            self.waker.register(cx.waker());
            // A bit might have been set between the swap and the registration.
            let bits = self.take();
            if bits != 0 {
                Poll::Ready(bits)
            } else {
                Poll::Pending
            }
        })
        .await
    }
}
impl Default for NotifyBits {
    fn default() -> Self {
        Self::new()
    }
}
