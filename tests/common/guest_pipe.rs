//! Guest-side test doubles shared by the tunnel integration tests

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use guest_bridge::pipe::{GuestPipe, WakeFlags};
use guest_bridge::reactor::EpollReactor;
use guest_bridge::tunnel::TunnelHub;

/// Guest pipe that records every notification it receives
#[derive(Default)]
pub struct RecordingPipe {
    pub wakes: RefCell<Vec<WakeFlags>>,
    pub closes: Cell<u32>,
}

impl RecordingPipe {
    pub fn new() -> (Rc<Self>, Weak<dyn GuestPipe>) {
        let pipe = Rc::new(Self::default());
        let weak = Rc::downgrade(&pipe) as Weak<dyn GuestPipe>;
        (pipe, weak)
    }

    pub fn wake_count(&self) -> usize {
        self.wakes.borrow().len()
    }

    pub fn woken_for(&self, flag: WakeFlags) -> bool {
        self.wakes.borrow().iter().any(|w| w.contains(flag))
    }
}

impl GuestPipe for RecordingPipe {
    fn wake(&self, flags: WakeFlags) {
        self.wakes.borrow_mut().push(flags);
    }

    fn close(&self) {
        self.closes.set(self.closes.get() + 1);
    }
}

/// Drive the reactor until `done` holds or `timeout` elapses
pub fn run_until<F>(hub: &mut TunnelHub<EpollReactor>, timeout: Duration, mut done: F) -> bool
where
    F: FnMut(&TunnelHub<EpollReactor>) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if done(hub) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let slice = (deadline - now).min(Duration::from_millis(50));
        hub.run_once(Some(slice)).unwrap();
    }
}
