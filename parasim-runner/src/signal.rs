// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for handling shutdown signals during a run.
//!
//! A signal cancels the run the same way retry exhaustion does: queued lane
//! attempts are dropped and in-flight subprocesses get a best-effort
//! terminate, while already-recorded passes are kept for the final report.

use crate::errors::SignalHandlerSetupError;
use tokio::signal::unix::{Signal, SignalKind, signal};

/// The kind of signal handling to set up for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalHandlerKind {
    /// The standard signal handler: capture interrupt, hangup, and
    /// termination signals.
    Standard,

    /// A no-op signal handler. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => Ok(SignalHandler::noop()),
        }
    }
}

/// The signal handler implementation.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    signals: Option<Signals>,
}

impl SignalHandler {
    fn new() -> Result<Self, SignalHandlerSetupError> {
        let signals = Signals::new()?;
        Ok(Self {
            signals: Some(signals),
        })
    }

    fn noop() -> Self {
        Self { signals: None }
    }

    pub(crate) async fn recv(&mut self) -> Option<ShutdownEvent> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => None,
        }
    }
}

#[derive(Debug)]
struct Signals {
    sigint: SignalWithDone,
    sighup: SignalWithDone,
    sigterm: SignalWithDone,
}

impl Signals {
    fn new() -> std::io::Result<Self> {
        let sigint = SignalWithDone::new(SignalKind::interrupt())?;
        let sighup = SignalWithDone::new(SignalKind::hangup())?;
        let sigterm = SignalWithDone::new(SignalKind::terminate())?;
        Ok(Self {
            sigint,
            sighup,
            sigterm,
        })
    }

    async fn recv(&mut self) -> Option<ShutdownEvent> {
        loop {
            tokio::select! {
                recv = self.sigint.signal.recv(), if !self.sigint.done => {
                    match recv {
                        Some(()) => break Some(ShutdownEvent::Interrupt),
                        None => self.sigint.done = true,
                    }
                }
                recv = self.sighup.signal.recv(), if !self.sighup.done => {
                    match recv {
                        Some(()) => break Some(ShutdownEvent::Hangup),
                        None => self.sighup.done = true,
                    }
                }
                recv = self.sigterm.signal.recv(), if !self.sigterm.done => {
                    match recv {
                        Some(()) => break Some(ShutdownEvent::Term),
                        None => self.sigterm.done = true,
                    }
                }
                else => break None,
            }
        }
    }
}

#[derive(Debug)]
struct SignalWithDone {
    signal: Signal,
    done: bool,
}

impl SignalWithDone {
    fn new(kind: SignalKind) -> std::io::Result<Self> {
        let signal = signal(kind)?;
        Ok(Self {
            signal,
            done: false,
        })
    }
}

/// A signal event that should cause the run to shut down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGHUP.
    Hangup,
    /// SIGTERM.
    Term,
    /// SIGINT.
    Interrupt,
}
