/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Single-value hand-off between a producer and one waiter.
//!
//! A [`OneShot`] receives either exactly one value or a cancellation. The
//! producer side cancels explicitly or by being dropped. Waiting works from
//! async code and from plain threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::common::{KaraboError, Result};

#[derive(Debug)]
enum State<T> {
    Pending,
    Delivered(T),
    Cancelled,
    Taken,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    condvar: Condvar,
    receiver_gone: AtomicBool,
}

impl<T> Shared<T> {
    fn complete(&self, next: State<T>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = next;
        drop(state);
        self.notify.notify_one();
        self.condvar.notify_all();
        true
    }

    fn take(&self) -> Option<Result<T>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Pending => {
                *state = State::Pending;
                None
            }
            State::Delivered(value) => Some(Ok(value)),
            State::Cancelled | State::Taken => Some(Err(KaraboError::Cancelled)),
        }
    }
}

/// Creates a connected sender and receiver.
pub fn oneshot<T>() -> (OneShotSender<T>, OneShot<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending),
        notify: Notify::new(),
        condvar: Condvar::new(),
        receiver_gone: AtomicBool::new(false),
    });
    (
        OneShotSender {
            shared: shared.clone(),
        },
        OneShot { shared },
    )
}

/// Producer half of a [`OneShot`].
#[derive(Debug)]
pub struct OneShotSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> OneShotSender<T> {
    /// Delivers the value. Returns `false` if the receiver is gone.
    pub fn deliver(self, value: T) -> bool {
        !self.shared.receiver_gone.load(Ordering::Acquire)
            && self.shared.complete(State::Delivered(value))
    }

    /// Cancels the waiter.
    pub fn cancel(self) {
        self.shared.complete(State::Cancelled);
    }

    /// Whether the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.receiver_gone.load(Ordering::Acquire)
    }
}

impl<T> Drop for OneShotSender<T> {
    fn drop(&mut self) {
        self.shared.complete(State::Cancelled);
    }
}

/// Receiver of a single value or a cancellation.
#[derive(Debug)]
pub struct OneShot<T> {
    shared: Arc<Shared<T>>,
}

impl<T> OneShot<T> {
    /// Waits for the value. A cancellation yields [`KaraboError::Cancelled`].
    pub async fn wait(self) -> Result<T> {
        loop {
            if let Some(result) = self.shared.take() {
                return result;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Blocks the calling thread until the value arrives or `timeout` passes.
    ///
    /// Must not be called from inside the async runtime.
    pub fn blocking_wait(self, timeout: Option<Duration>) -> Result<T> {
        let mut state = self.shared.state.lock();
        while matches!(*state, State::Pending) {
            match timeout {
                Some(limit) => {
                    if self.shared.condvar.wait_for(&mut state, limit).timed_out() {
                        return Err(KaraboError::Timeout("one-shot value".to_string()));
                    }
                }
                None => self.shared.condvar.wait(&mut state),
            }
        }
        drop(state);
        self.shared
            .take()
            .unwrap_or(Err(KaraboError::Cancelled))
    }

    /// Takes the outcome if one is already there.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        self.shared.take()
    }

    /// Whether a value or cancellation has arrived.
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending)
    }
}

impl<T> Drop for OneShot<T> {
    fn drop(&mut self) {
        self.shared.receiver_gone.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_once() {
        let (tx, rx) = oneshot();
        assert!(tx.deliver(7));
        assert_eq!(rx.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_sender_cancels() {
        let (tx, rx) = oneshot::<u8>();
        let waiter = tokio::spawn(rx.wait());
        drop(tx);
        assert_eq!(waiter.await.unwrap(), Err(KaraboError::Cancelled));
    }

    #[test]
    fn blocking_waiter_on_another_thread() {
        let (tx, rx) = oneshot();
        let handle = std::thread::spawn(move || rx.blocking_wait(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        tx.deliver("done");
        assert_eq!(handle.join().unwrap().unwrap(), "done");
    }

    #[test]
    fn blocking_wait_times_out() {
        let (_tx, rx) = oneshot::<u8>();
        let result = rx.blocking_wait(Some(Duration::from_millis(10)));
        assert!(matches!(result, Err(KaraboError::Timeout(_))));
    }

    #[test]
    fn delivery_to_dropped_receiver_fails() {
        let (tx, rx) = oneshot();
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.deliver(1));
    }
}
