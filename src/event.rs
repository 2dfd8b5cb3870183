// event loop plumbing: state machines implement `OnEvent` and run inside a
// `Session`, which owns an unbounded event channel and delivers timers as
// ordinary events. periodic behavior is re-armed by handlers
use std::{collections::HashMap, fmt::Debug, time::Duration};

use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub trait SendEvent<M> {
    fn send(&mut self, event: M) -> anyhow::Result<()>;
}

pub trait OnEvent<M> {
    fn on_event(&mut self, event: M, timer: &mut dyn Timer<M>) -> anyhow::Result<()>;
}

impl<N: Into<M>, M> SendEvent<N> for UnboundedSender<M> {
    fn send(&mut self, event: N) -> anyhow::Result<()> {
        UnboundedSender::send(self, event.into()).map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

pub type TimerId = u32;

pub trait Timer<M> {
    fn set_internal(&mut self, duration: Duration, event: M) -> anyhow::Result<TimerId>;

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()>;
}

impl<M> dyn Timer<M> + '_ {
    pub fn set(&mut self, duration: Duration, event: impl Into<M>) -> anyhow::Result<TimerId> {
        self.set_internal(duration, event.into())
    }
}

/// Discards every timer request, for driving handlers that never arm one.
#[derive(Debug)]
pub struct NullTimer;

impl<M> Timer<M> for NullTimer {
    fn set_internal(&mut self, _: Duration, _: M) -> anyhow::Result<TimerId> {
        Ok(0)
    }

    fn unset(&mut self, _: TimerId) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum SessionEvent<M> {
    Timer(TimerId, M),
    Other(M),
}

#[derive(Debug)]
pub struct SessionSender<M>(UnboundedSender<SessionEvent<M>>);

impl<M> Clone for SessionSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M: Into<N>, N> SendEvent<M> for SessionSender<N> {
    fn send(&mut self, event: M) -> anyhow::Result<()> {
        self.0
            .send(SessionEvent::Other(event.into()))
            .map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

pub struct Session<M> {
    sender: UnboundedSender<SessionEvent<M>>,
    receiver: UnboundedReceiver<SessionEvent<M>>,
    shutdown: CancellationToken,
    timer_id: TimerId,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl<M> Debug for Session<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("timer_id", &self.timer_id)
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}

impl<M> Session<M> {
    pub fn new(shutdown: CancellationToken) -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver,
            shutdown,
            timer_id: 0,
            timers: Default::default(),
        }
    }

    pub fn sender(&self) -> SessionSender<M> {
        SessionSender(self.sender.clone())
    }

    /// Dispatch events into `state` until the shutdown token fires. Returns
    /// Ok on shutdown so a clean quit maps to exit code 0.
    pub async fn run(&mut self, state: &mut impl OnEvent<M>) -> anyhow::Result<()>
    where
        M: Send + 'static,
    {
        loop {
            enum Select<M> {
                Recv(Option<SessionEvent<M>>),
                Shutdown,
            }
            let selected = tokio::select! {
                _ = self.shutdown.cancelled() => Select::Shutdown,
                received = self.receiver.recv() => Select::Recv(received),
            };
            let event = match selected {
                Select::Shutdown => return Ok(()),
                Select::Recv(received) => {
                    match received.ok_or(anyhow::anyhow!("channel closed"))? {
                        SessionEvent::Timer(timer_id, event) => {
                            if self.timers.remove(&timer_id).is_some() {
                                event
                            } else {
                                // unset/fire contention: the timer task had already
                                // queued its event when it was unset, skip it
                                continue;
                            }
                        }
                        SessionEvent::Other(event) => event,
                    }
                }
            };
            state.on_event(event, self)?
        }
    }
}

impl<M: Send + 'static> Timer<M> for Session<M> {
    fn set_internal(&mut self, duration: Duration, event: M) -> anyhow::Result<TimerId> {
        self.timer_id += 1;
        let timer_id = self.timer_id;
        let sender = self.sender.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // receiver may be gone during shutdown
            let _ = sender.send(SessionEvent::Timer(timer_id, event));
        });
        self.timers.insert(timer_id, timer);
        Ok(timer_id)
    }

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()> {
        self.timers
            .remove(&timer_id)
            .ok_or(anyhow::anyhow!("no timer {timer_id}"))?
            .abort();
        Ok(())
    }
}
