//! 后端共享状态：关闭标记、事件/错误通道与关闭信号。
//!
//! 互斥锁从不跨 `.await` 持有。

use crate::error::PresenceError;
use domain::Event;
use presence_telemetry::{record_async_error, record_event_dropped, record_event_emitted};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

struct Inner {
    closed: bool,
    listening: bool,
    events: Option<mpsc::Sender<Event>>,
    /// 构造时预先创建、尚未被监听者取走的接收端。
    pending: Option<mpsc::Receiver<Event>>,
}

pub(crate) struct BackendState {
    inner: Mutex<Inner>,
    event_buffer: usize,
    close_tx: watch::Sender<bool>,
    errors_tx: mpsc::Sender<PresenceError>,
    errors_rx: Mutex<Option<mpsc::Receiver<PresenceError>>>,
}

impl BackendState {
    pub(crate) fn new(event_buffer: usize, error_buffer: usize) -> Self {
        let (close_tx, _) = watch::channel(false);
        let (errors_tx, errors_rx) = mpsc::channel(error_buffer.max(1));
        Self {
            inner: Mutex::new(Inner {
                closed: false,
                listening: false,
                events: None,
                pending: None,
            }),
            event_buffer: event_buffer.max(1),
            close_tx,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// 立即创建事件通道；没有监听者时事件在缓冲满后被丢弃。
    pub(crate) fn with_event_channel(self) -> Self {
        {
            let mut inner = self.lock();
            let (tx, rx) = mpsc::channel(self.event_buffer);
            inner.events = Some(tx);
            inner.pending = Some(rx);
        }
        self
    }

    // 关闭标记没有可被 panic 破坏的不变量，中毒后直接取回
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn ensure_open(&self) -> Result<(), PresenceError> {
        if self.is_closed() {
            return Err(PresenceError::Closed);
        }
        Ok(())
    }

    /// 监听前检查：已关闭或已有监听者时拒绝。
    pub(crate) fn ensure_can_listen(&self) -> Result<(), PresenceError> {
        let inner = self.lock();
        if inner.closed {
            return Err(PresenceError::Closed);
        }
        if inner.listening {
            return Err(PresenceError::AlreadyListening);
        }
        Ok(())
    }

    /// 登记唯一的监听者并交出事件接收端。
    pub(crate) fn listen(&self) -> Result<mpsc::Receiver<Event>, PresenceError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PresenceError::Closed);
        }
        if inner.listening {
            return Err(PresenceError::AlreadyListening);
        }
        inner.listening = true;
        if let Some(rx) = inner.pending.take() {
            return Ok(rx);
        }
        let (tx, rx) = mpsc::channel(self.event_buffer);
        inner.events = Some(tx);
        Ok(rx)
    }

    /// 置关闭标记、丢弃事件发送端并广播关闭信号。
    pub(crate) fn close(&self) -> Result<(), PresenceError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PresenceError::AlreadyClosed);
            }
            inner.closed = true;
            inner.events = None;
            inner.pending = None;
        }
        self.close_tx.send_replace(true);
        Ok(())
    }

    /// 事件来源终止：丢弃发送端，监听者随后收到通道结束。
    ///
    /// 后端保持打开，但不会再有状态变化事件。
    pub(crate) fn detach_events(&self) {
        let mut inner = self.lock();
        inner.events = None;
        inner.pending = None;
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// 非阻塞投递；通道满或无人接收时丢弃。
    pub(crate) fn try_emit(&self, event: Event) -> bool {
        let inner = self.lock();
        if inner.closed {
            return false;
        }
        let Some(tx) = inner.events.as_ref() else {
            record_event_dropped();
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => {
                record_event_emitted();
                true
            }
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                record_event_dropped();
                debug!(
                    target: "presence.engine",
                    id = %event.id,
                    status = %event.status,
                    "event_dropped"
                );
                false
            }
        }
    }

    /// 阻塞投递：通道满时等待空位，关闭可打断等待。
    pub(crate) async fn emit(&self, event: Event) -> bool {
        let (sender, mut closed) = {
            let inner = self.lock();
            if inner.closed {
                return false;
            }
            match inner.events.as_ref() {
                Some(tx) => (tx.clone(), self.close_tx.subscribe()),
                None => return false,
            }
        };
        tokio::select! {
            permit = sender.reserve() => {
                let Ok(permit) = permit else {
                    return false;
                };
                let inner = self.lock();
                if inner.closed {
                    return false;
                }
                permit.send(event);
                record_event_emitted();
                true
            }
            _ = closed.changed() => false,
        }
    }

    /// 上报异步错误：记录日志，并尽力送入错误通道。
    pub(crate) fn report(&self, err: PresenceError) {
        record_async_error();
        warn!(target: "presence.engine", error = %err, "async_error");
        if let Err(TrySendError::Full(err)) = self.errors_tx.try_send(err) {
            debug!(target: "presence.engine", error = %err, "error_channel_full");
        }
    }

    pub(crate) fn take_errors(&self) -> Option<mpsc::Receiver<PresenceError>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
