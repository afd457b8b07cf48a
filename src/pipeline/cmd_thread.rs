//! A named worker thread woken by counted commands.
//!
//! Each `DoNextJob` is one permit: the worker takes one job from whatever
//! queue it serves per permit, and blocks when none are outstanding.

use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, error};

use crate::error::{HalError, HalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    DoNextJob,
    Exit,
}

/// Cloneable sending side of a [`CmdThread`], for producers that do not own it
#[derive(Clone)]
pub struct CmdWaker(Sender<CmdKind>);

impl CmdWaker {
    pub fn send(&self, cmd: CmdKind) -> HalResult<()> {
        self.0.send(cmd).map_err(|_| HalError::Shutdown)
    }
}

pub struct CmdThread {
    name: String,
    tx: Sender<CmdKind>,
    handle: Option<JoinHandle<()>>,
}

impl CmdThread {
    /// Spawn `body`, called once per received command until it sees `Exit`.
    pub fn launch<F>(name: &str, mut body: F) -> HalResult<Self>
    where
        F: FnMut(CmdKind) + Send + 'static,
    {
        let (tx, rx): (Sender<CmdKind>, Receiver<CmdKind>) = unbounded();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(thread = %thread_name, "Worker started");
                while let Ok(cmd) = rx.recv() {
                    body(cmd);
                    if cmd == CmdKind::Exit {
                        break;
                    }
                }
                debug!(thread = %thread_name, "Worker exiting");
            })
            .map_err(|e| HalError::NoMemory(format!("spawn {name}: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            tx,
            handle: Some(handle),
        })
    }

    pub fn send(&self, cmd: CmdKind) -> HalResult<()> {
        self.tx.send(cmd).map_err(|_| HalError::Shutdown)
    }

    pub fn waker(&self) -> CmdWaker {
        CmdWaker(self.tx.clone())
    }

    /// Ask the worker to leave its loop and wait for it.
    pub fn exit(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.tx.send(CmdKind::Exit);
        if handle.thread().id() == std::thread::current().id() {
            error!(thread = %self.name, "Worker asked to join itself");
            return;
        }
        if handle.join().is_err() {
            error!(thread = %self.name, "Worker panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for CmdThread {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn one_call_per_command_then_exit() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut t = CmdThread::launch("test-worker", move |cmd| {
            tx.send(cmd).unwrap();
        })
        .unwrap();
        t.send(CmdKind::DoNextJob).unwrap();
        t.send(CmdKind::DoNextJob).unwrap();
        t.exit();
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got, vec![CmdKind::DoNextJob, CmdKind::DoNextJob, CmdKind::Exit]);
        assert!(!t.is_running());
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }
}
