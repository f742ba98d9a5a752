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

//! Snoozable timers owned by an instance.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::common::UnitCallback;

/// When a timer armed at `first_armed` and started again at `now` fires.
///
/// Restarting postpones the deadline to `now + timeout`, but never past
/// `first_armed + flush_interval`.
pub(crate) fn next_deadline(
    now: Instant,
    first_armed: Instant,
    timeout: Duration,
    flush_interval: Option<Duration>,
) -> Instant {
    let snoozed = now + timeout;
    match flush_interval {
        Some(flush) => snoozed.min(first_armed + flush),
        None => snoozed,
    }
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    first_armed: Option<Instant>,
    driver: bool,
}

struct TimerInner {
    callback: UnitCallback,
    timeout: Duration,
    single_shot: bool,
    flush_interval: Option<Duration>,
    state: Mutex<TimerState>,
    wake: Notify,
    destroyed: CancellationToken,
}

/// A timer that calls back after `timeout`.
///
/// Calling [`start`](Self::start) while the timer runs postpones the
/// callback ("snooze"). With a flush interval the callback still fires at
/// most `flush_interval` after the first start. Periodic timers re-arm
/// after every firing; single-shot timers stop.
#[derive(Clone)]
pub struct AsyncTimer {
    inner: Arc<TimerInner>,
}

impl fmt::Debug for AsyncTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTimer")
            .field("timeout", &self.inner.timeout)
            .field("single_shot", &self.inner.single_shot)
            .field("flush_interval", &self.inner.flush_interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl AsyncTimer {
    /// A periodic timer without flush interval.
    pub fn new<F, Fut>(timeout: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_options(timeout, false, None, callback)
    }

    /// A timer with every option spelled out.
    pub fn with_options<F, Fut>(
        timeout: Duration,
        single_shot: bool,
        flush_interval: Option<Duration>,
        callback: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: UnitCallback = Arc::new(move || callback().boxed());
        Self {
            inner: Arc::new(TimerInner {
                callback,
                timeout,
                single_shot,
                flush_interval,
                state: Mutex::new(TimerState::default()),
                wake: Notify::new(),
                destroyed: CancellationToken::new(),
            }),
        }
    }

    /// Arms the timer, or snoozes it if it is already armed.
    pub fn start(&self) {
        if self.inner.destroyed.is_cancelled() {
            return;
        }
        let now = Instant::now();
        let spawn_driver = {
            let mut state = self.inner.state.lock();
            let first = *state.first_armed.get_or_insert(now);
            state.deadline = Some(next_deadline(
                now,
                first,
                self.inner.timeout,
                self.inner.flush_interval,
            ));
            !std::mem::replace(&mut state.driver, true)
        };
        if spawn_driver {
            let inner = self.inner.clone();
            tokio::spawn(drive(inner));
        } else {
            self.inner.wake.notify_one();
        }
    }

    /// Disarms the timer without firing.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.deadline = None;
            state.first_armed = None;
        }
        self.inner.wake.notify_one();
    }

    /// Stops the timer for good; later starts are ignored.
    pub fn destroy(&self) {
        self.stop();
        self.inner.destroyed.cancel();
    }

    /// Whether a firing is pending.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().deadline.is_some()
    }

    /// Whether [`destroy`](Self::destroy) was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.is_cancelled()
    }

    pub(crate) fn downgrade(&self) -> WeakTimer {
        WeakTimer(Arc::downgrade(&self.inner))
    }
}

/// Non-owning reference kept by the instance.
#[derive(Clone)]
pub(crate) struct WeakTimer(Weak<TimerInner>);

impl WeakTimer {
    pub(crate) fn upgrade(&self) -> Option<AsyncTimer> {
        self.0.upgrade().map(|inner| AsyncTimer { inner })
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

async fn drive(inner: Arc<TimerInner>) {
    loop {
        let deadline = {
            let mut state = inner.state.lock();
            match state.deadline {
                Some(deadline) => deadline,
                None => {
                    state.driver = false;
                    return;
                }
            }
        };
        tokio::select! {
            biased;
            () = inner.destroyed.cancelled() => {
                inner.state.lock().driver = false;
                return;
            }
            () = inner.wake.notified() => continue,
            () = tokio::time::sleep_until(deadline) => {}
        }
        {
            let mut state = inner.state.lock();
            match state.deadline {
                Some(current) if current <= Instant::now() => {}
                _ => continue,
            }
            if inner.single_shot {
                state.deadline = None;
                state.first_armed = None;
            } else {
                let now = Instant::now();
                state.first_armed = Some(now);
                state.deadline = Some(now + inner.timeout);
            }
        }
        trace!("Timer fired");
        (inner.callback)().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn snooze_is_capped_by_flush_interval() {
        let first = Instant::now();
        let timeout = Duration::from_millis(100);
        let now = first + Duration::from_millis(80);
        assert_eq!(next_deadline(now, first, timeout, None), now + timeout);
        assert_eq!(
            next_deadline(now, first, timeout, Some(Duration::from_millis(150))),
            first + Duration::from_millis(150)
        );
        assert_eq!(
            next_deadline(first, first, timeout, Some(Duration::from_millis(150))),
            first + timeout
        );
    }

    fn counting(single_shot: bool, flush: Option<Duration>) -> (AsyncTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = AsyncTimer::with_options(Duration::from_millis(50), single_shot, flush, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (timer, fired)
    }

    #[tokio::test]
    async fn single_shot_fires_once() {
        let (timer, fired) = counting(true, None);
        timer.start();
        assert!(timer.is_running());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn restarting_snoozes() {
        let (timer, fired) = counting(true, None);
        timer.start();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            timer.start();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_and_destroy_prevent_firing() {
        let (timer, fired) = counting(false, None);
        timer.start();
        timer.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        timer.destroy();
        timer.start();
        assert!(timer.is_destroyed());
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn periodic_timer_rearms() {
        let (timer, fired) = counting(false, None);
        timer.start();
        tokio::time::sleep(Duration::from_millis(290)).await;
        timer.destroy();
        assert!(fired.load(Ordering::SeqCst) >= 3);
    }
}
