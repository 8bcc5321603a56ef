//! Registry worker thread
//!
//! One dedicated thread owns the bus connection and the unit map. Public
//! entry points post operations over a channel and await the reply, so
//! every RPC and every map mutation happens here, serialized. Shutdown
//! trips a cancellation flag; operations still queued are answered with
//! Cancelled.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, watch};

use crate::jobs::bus::{BusEvent, SystemdBus, ZbusSystemd};
use crate::jobs::handshake::StartingSignal;
use crate::jobs::systemd::SystemdJobs;
use crate::jobs::{JobError, JobSignals, JobsHandle, Op};

const OP_QUEUE_DEPTH: usize = 32;

pub(crate) struct Worker {
    cancel: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker; it connects to the user bus once it is running
    pub fn spawn(signals: JobSignals, starting: Arc<StartingSignal>) -> (Self, JobsHandle) {
        Self::spawn_inner(signals, starting, None)
    }

    /// Start the worker over an externally supplied bus
    #[cfg(test)]
    pub fn spawn_with_bus(
        signals: JobSignals,
        starting: Arc<StartingSignal>,
        bus: Arc<dyn SystemdBus>,
        events: mpsc::Receiver<BusEvent>,
    ) -> (Self, JobsHandle) {
        Self::spawn_inner(signals, starting, Some((bus, events)))
    }

    fn spawn_inner(
        signals: JobSignals,
        starting: Arc<StartingSignal>,
        preset: Option<(Arc<dyn SystemdBus>, mpsc::Receiver<BusEvent>)>,
    ) -> (Self, JobsHandle) {
        let (op_tx, op_rx) = mpsc::channel(OP_QUEUE_DEPTH);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name("ual-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        log::error!("Unable to build worker runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(run(op_rx, cancel_rx, signals, starting, preset));
            })
            .ok();

        if thread.is_none() {
            log::error!("Unable to spawn worker thread");
        }

        (
            Self {
                cancel: cancel_tx,
                thread,
            },
            JobsHandle::new(op_tx),
        )
    }

    /// Trip cancellation and wait for the worker to drain
    pub fn shutdown(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(
    mut ops: mpsc::Receiver<Op>,
    mut cancel: watch::Receiver<bool>,
    signals: JobSignals,
    starting: Arc<StartingSignal>,
    preset: Option<(Arc<dyn SystemdBus>, mpsc::Receiver<BusEvent>)>,
) {
    let (bus, mut events) = match preset {
        Some(pair) => pair,
        None => match ZbusSystemd::connect().await {
            Ok((bus, events)) => (Arc::new(bus) as Arc<dyn SystemdBus>, events),
            Err(e) => {
                log::warn!("Unable to connect to user bus: {}", e);
                serve_disconnected(ops, cancel).await;
                return;
            }
        },
    };

    let mut jobs = SystemdJobs::new(bus, signals, starting);
    jobs.connect().await;

    let mut events_open = true;
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            op = ops.recv() => {
                match op {
                    Some(op) => dispatch(&mut jobs, op).await,
                    None => break,
                }
            }
            event = events.recv(), if events_open => {
                match event {
                    Some(event) => jobs.handle_event(event).await,
                    None => events_open = false,
                }
            }
        }
    }

    // Anything still queued completes with Cancelled
    ops.close();
    while let Some(op) = ops.recv().await {
        fail_op(op, JobError::Cancelled);
    }
}

/// Answer operations when no bus connection could be made
async fn serve_disconnected(mut ops: mpsc::Receiver<Op>, mut cancel: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            op = ops.recv() => {
                match op {
                    Some(op) => fail_op(op, JobError::Bus("no user bus connection".to_string())),
                    None => break,
                }
            }
        }
    }

    ops.close();
    while let Some(op) = ops.recv().await {
        fail_op(op, JobError::Cancelled);
    }
}

async fn dispatch(jobs: &mut SystemdJobs, op: Op) {
    match op {
        Op::Launch { req, reply } => {
            let _ = reply.send(jobs.launch(req).await);
        }
        Op::PrimaryPid { info, reply } => {
            let _ = reply.send(Ok(jobs.primary_pid(&info).await));
        }
        Op::Pids { info, reply } => {
            let _ = reply.send(Ok(jobs.pids(&info).await));
        }
        Op::Stop { info, reply } => {
            let _ = reply.send(jobs.stop(&info).await);
        }
        Op::Instances { appid, job, reply } => {
            let _ = reply.send(Ok(jobs.instances_of(&appid, &job)));
        }
        Op::RunningAppIds { jobs: job_list, reply } => {
            let _ = reply.send(Ok(jobs.running_app_ids(&job_list)));
        }
    }
}

fn fail_op(op: Op, error: JobError) {
    match op {
        Op::Launch { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Op::PrimaryPid { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Op::Pids { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Op::Stop { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Op::Instances { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Op::RunningAppIds { reply, .. } => {
            let _ = reply.send(Err(error));
        }
    }
}
