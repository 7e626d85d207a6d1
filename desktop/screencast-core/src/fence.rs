use crate::error::FenceError;
use smithay::reexports::calloop::generic::Generic;
use smithay::reexports::calloop::timer::{TimeoutAction, Timer};
use smithay::reexports::calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use std::cell::Cell;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::trace;

/// The bits of the compositor's event loop the pipeline needs: one-shot fd
/// readiness and one-shot timers, both cancellable.
pub trait Reactor {
    fn watch_readable(
        &self,
        fd: OwnedFd,
        callback: Box<dyn FnOnce()>,
    ) -> Result<RegistrationToken, FenceError>;

    fn schedule(
        &self,
        after: Duration,
        callback: Box<dyn FnOnce()>,
    ) -> Result<RegistrationToken, FenceError>;

    fn cancel(&self, token: RegistrationToken);
}

impl<D: 'static> Reactor for LoopHandle<'static, D> {
    fn watch_readable(
        &self,
        fd: OwnedFd,
        callback: Box<dyn FnOnce()>,
    ) -> Result<RegistrationToken, FenceError> {
        let mut callback = Some(callback);
        self.insert_source(
            Generic::new(fd, Interest::READ, Mode::OneShot),
            move |_, _, _| {
                if let Some(callback) = callback.take() {
                    callback();
                }
                Ok(PostAction::Remove)
            },
        )
        .map_err(|err| FenceError::Watch(err.error.to_string()))
    }

    fn schedule(
        &self,
        after: Duration,
        callback: Box<dyn FnOnce()>,
    ) -> Result<RegistrationToken, FenceError> {
        let mut callback = Some(callback);
        self.insert_source(Timer::from_duration(after), move |_, _, _| {
            if let Some(callback) = callback.take() {
                callback();
            }
            TimeoutAction::Drop
        })
        .map_err(|err| FenceError::Timer(err.error.to_string()))
    }

    fn cancel(&self, token: RegistrationToken) {
        self.remove(token);
    }
}

/// Holds back one buffer until the GPU fence of its rendering signals.
///
/// At most one wait is pending. Cancelling drops the fence fd without running
/// the callback.
pub struct FenceGate {
    reactor: Rc<dyn Reactor>,
    token: Rc<Cell<Option<RegistrationToken>>>,
}

impl FenceGate {
    pub fn new(reactor: Rc<dyn Reactor>) -> Self {
        FenceGate {
            reactor,
            token: Rc::new(Cell::new(None)),
        }
    }

    pub fn wait(&self, fence: OwnedFd, on_signal: impl FnOnce() + 'static) -> Result<(), FenceError> {
        self.cancel();

        let slot = self.token.clone();
        let token = self.reactor.watch_readable(
            fence,
            Box::new(move || {
                slot.set(None);
                trace!("Render fence signalled");
                on_signal();
            }),
        )?;
        self.token.set(Some(token));
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.token.get().is_some()
    }

    pub fn cancel(&self) {
        if let Some(token) = self.token.take() {
            self.reactor.cancel(token);
        }
    }
}

impl Drop for FenceGate {
    fn drop(&mut self) {
        self.cancel();
    }
}
