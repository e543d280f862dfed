use crate::{
    config::Config,
    error::{Result, SmuxError},
    frame::Frame,
    session::SessionInner,
};
use bytes::{Buf, Bytes};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    io,
    pin::Pin,
    sync::{Arc, Weak},
    task::{ready, Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::Notify,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Observable lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both halves open.
    Open,
    /// The local side sent FIN; data from the peer may still arrive.
    LocalClosed,
    /// The peer sent FIN; the local side may still write.
    RemoteClosed,
    /// Both halves closed, or the session died.
    Closed,
}

/// What happened to an inbound data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pushed {
    Accepted,
    Discarded,
}

#[derive(Debug)]
struct StreamInner {
    buffers: VecDeque<Bytes>,
    /// Received bytes not yet handed to the user.
    buffered: usize,
    /// Total bytes handed to the user (wrapping, as announced in UPD).
    num_read: u32,
    /// Bytes handed to the user since the last UPD.
    incr: u32,
    /// Total bytes queued for the peer (wrapping).
    num_written: u32,
    peer_consumed: u32,
    peer_window: u32,
    local_closed: bool,
    remote_closed: bool,
    /// Every user handle has been dropped.
    released: bool,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    /// Terminal cause recorded when the session died.
    error: Option<SmuxError>,
}

impl StreamInner {
    fn readable(&self) -> bool {
        self.released
            || self.error.is_some()
            || self.buffered > 0
            || self.remote_closed
            || deadline_passed(self.read_deadline)
    }

    fn state(&self) -> StreamState {
        match (self.local_closed, self.remote_closed) {
            _ if self.error.is_some() => StreamState::Closed,
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::LocalClosed,
            (false, true) => StreamState::RemoteClosed,
            (false, false) => StreamState::Open,
        }
    }

    /// Copies buffered data into `buf`, consuming whole chunks where possible.
    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };
            let n = front.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                self.buffers.pop_front();
            }
            copied += n;
        }
        self.buffered -= copied;
        copied
    }
}

/// Stream state shared between the session (which feeds inbound data and
/// close signals) and the user handles.
pub(crate) struct StreamShared {
    id: u32,
    config: Arc<Config>,
    state: Mutex<StreamInner>,
    read_event: Notify,
    write_event: Notify,
    frame_tx: flume::Sender<Frame>,
    ctrl_tx: flume::Sender<Frame>,
    die: CancellationToken,
    session: Weak<SessionInner>,
}

impl fmt::Debug for StreamShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamShared")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl StreamShared {
    pub(crate) fn new(id: u32, session: &Arc<SessionInner>) -> Arc<Self> {
        let config = session.config();
        Arc::new(Self {
            id,
            state: Mutex::new(StreamInner {
                buffers: VecDeque::new(),
                buffered: 0,
                num_read: 0,
                incr: 0,
                num_written: 0,
                peer_consumed: 0,
                // Nothing is sent until the peer advertises its window.
                peer_window: 0,
                local_closed: false,
                remote_closed: false,
                released: false,
                read_deadline: None,
                write_deadline: None,
                error: None,
            }),
            config,
            read_event: Notify::new(),
            write_event: Notify::new(),
            frame_tx: session.frame_sender(),
            ctrl_tx: session.control_sender(),
            die: session.die_token(),
            session: Arc::downgrade(session),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().buffered
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state.lock().state()
    }

    /// The UPD announcing this side's full receive window, sent once when
    /// the stream is opened or accepted.
    pub(crate) fn window_advertisement(&self) -> Option<Frame> {
        self.config.windowed().then(|| {
            Frame::upd(self.config.version, self.id, 0, window_size(&self.config))
        })
    }

    /// Cause to report once the session is gone.
    fn dead_error(&self) -> SmuxError {
        if let Some(err) = self.state.lock().error.clone() {
            return err;
        }
        self.session
            .upgrade()
            .and_then(|session| session.close_cause())
            .unwrap_or(SmuxError::SessionClosed)
    }

    // ---- inbound, called by the session reader ----

    /// Appends inbound data.
    ///
    /// Fails with `FlowControlViolation` when per-stream windows are in force
    /// and the peer sent beyond what this stream advertised.
    pub(crate) fn push(&self, data: Bytes) -> Result<Pushed> {
        let mut st = self.state.lock();
        if st.remote_closed || st.released || st.error.is_some() {
            return Ok(Pushed::Discarded);
        }

        if self.config.windowed() && st.buffered + data.len() > self.config.max_stream_buffer {
            return Err(SmuxError::FlowControlViolation(self.id));
        }

        st.buffered += data.len();
        st.buffers.push_back(data);
        drop(st);

        self.read_event.notify_waiters();
        Ok(Pushed::Accepted)
    }

    /// Whether more inbound data would be dropped rather than buffered.
    pub(crate) fn is_discarding(&self) -> bool {
        let st = self.state.lock();
        st.remote_closed || st.released || st.error.is_some()
    }

    /// Marks the remote half closed. Returns true if both halves are now
    /// closed.
    pub(crate) fn remote_fin(&self) -> bool {
        let mut st = self.state.lock();
        if st.remote_closed {
            return false;
        }
        st.remote_closed = true;
        let fully_closed = st.local_closed;
        drop(st);

        self.read_event.notify_waiters();
        fully_closed
    }

    /// Applies a window update from the peer.
    pub(crate) fn update_window(&self, consumed: u32, window: u32) {
        {
            let mut st = self.state.lock();
            st.peer_consumed = consumed;
            st.peer_window = window;
        }
        self.write_event.notify_waiters();
    }

    /// Terminal transition when the session dies.
    pub(crate) fn session_died(&self, cause: &SmuxError) {
        {
            let mut st = self.state.lock();
            if st.error.is_none() {
                st.error = Some(cause.clone());
            }
        }
        self.read_event.notify_waiters();
        self.write_event.notify_waiters();
    }

    // ---- read path ----

    /// Non-blocking read. `None` means the caller has to wait.
    fn try_read(&self, buf: &mut [u8]) -> Option<Result<usize>> {
        let mut st = self.state.lock();
        if st.released {
            return Some(Err(SmuxError::Closed));
        }
        if let Some(err @ SmuxError::SessionClosed) = &st.error {
            return Some(Err(err.clone()));
        }

        if st.buffered > 0 {
            let n = st.drain_into(buf);
            let update = self.account_read(&mut st, n);
            drop(st);

            self.after_read(n, update);
            return Some(Ok(n));
        }

        if deadline_passed(st.read_deadline) {
            return Some(Err(SmuxError::Timeout));
        }
        if st.remote_closed {
            return Some(Err(SmuxError::EndOfStream));
        }
        if let Some(err) = &st.error {
            return Some(Err(err.clone()));
        }
        None
    }

    /// Updates the consumed counters; returns a window update to send, if
    /// one is due.
    fn account_read(&self, st: &mut StreamInner, n: usize) -> Option<Frame> {
        st.num_read = st.num_read.wrapping_add(n as u32);
        st.incr = st.incr.saturating_add(n as u32);

        if !self.config.windowed() {
            return None;
        }

        let window = window_size(&self.config);
        if st.incr >= window / 2 {
            st.incr = 0;
            return Some(Frame::upd(
                self.config.version,
                self.id,
                st.num_read,
                window,
            ));
        }
        None
    }

    fn after_read(&self, n: usize, update: Option<Frame>) {
        if let Some(session) = self.session.upgrade() {
            session.release_receive_budget(n);
        }
        if let Some(frame) = update {
            tracing::trace!(stream_id = self.id, cmd = ?frame.cmd, "sending window update");
            // The control lane is unbounded; it only fails once the writer is gone.
            let _ = self.ctrl_tx.send(frame);
        }
    }

    /// Resolves once a read can make progress or must fail.
    async fn wait_readable(&self) {
        loop {
            let notified = self.read_event.notified();
            let deadline = {
                let st = self.state.lock();
                if st.readable() {
                    return;
                }
                st.read_deadline
            };

            tokio::select! {
                _ = notified => {}
                _ = sleep_until_deadline(deadline) => return,
            }
        }
    }

    pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(result) = self.try_read(buf) {
                return result;
            }
            self.wait_readable().await;
        }
    }

    // ---- write path ----

    /// Queues `data` as PSH frames of at most `max_frame_size` bytes.
    ///
    /// Returns the number of bytes queued. A short count is returned only
    /// when the stream, the session or the write deadline ended the write
    /// after some data had already been queued.
    pub(crate) async fn write_all(&self, data: Bytes) -> Result<usize> {
        let mut sent = 0;

        while sent < data.len() {
            let notified = self.write_event.notified();
            let reserved = self.reserve_write(data.len() - sent);
            let (chunk, deadline) = match reserved {
                Ok(reserved) => reserved,
                Err(err) if sent > 0 => {
                    tracing::debug!(stream_id = self.id, sent, %err, "partial write");
                    return Ok(sent);
                }
                Err(err) => return Err(err),
            };

            if chunk == 0 {
                // Peer window exhausted; wait for an UPD, a state change or
                // the deadline.
                tokio::select! {
                    _ = notified => {}
                    _ = sleep_until_deadline(deadline) => {}
                    _ = self.die.cancelled() => {}
                }
                continue;
            }

            let frame = Frame::psh(
                self.config.version,
                self.id,
                data.slice(sent..sent + chunk),
            );
            let queued = tokio::select! {
                biased;
                _ = self.die.cancelled() => Err(self.dead_error()),
                _ = sleep_until_deadline(deadline) => Err(SmuxError::Timeout),
                r = self.frame_tx.send_async(frame) => r.map_err(|_| self.dead_error()),
            };

            if let Err(err) = queued {
                self.unreserve_write(chunk);
                if sent > 0 {
                    return Ok(sent);
                }
                return Err(err);
            }
            sent += chunk;
        }

        Ok(sent)
    }

    /// Reserves up to `remaining` bytes of the peer's window for one frame.
    fn reserve_write(&self, remaining: usize) -> Result<(usize, Option<Instant>)> {
        let mut st = self.state.lock();
        if st.local_closed || st.released {
            return Err(SmuxError::Closed);
        }
        if let Some(err) = &st.error {
            return Err(err.clone());
        }
        if deadline_passed(st.write_deadline) {
            return Err(SmuxError::Timeout);
        }

        let mut chunk = remaining.min(self.config.max_frame_size);
        if self.config.windowed() {
            let inflight = st.num_written.wrapping_sub(st.peer_consumed) as i64;
            let window = st.peer_window as i64 - inflight;
            chunk = chunk.min(window.max(0) as usize);
        }
        st.num_written = st.num_written.wrapping_add(chunk as u32);

        Ok((chunk, st.write_deadline))
    }

    fn unreserve_write(&self, chunk: usize) {
        let mut st = self.state.lock();
        st.num_written = st.num_written.wrapping_sub(chunk as u32);
    }

    // ---- close ----

    /// Closes the local half: further writes fail, a FIN is queued once.
    pub(crate) async fn close(&self) -> Result<()> {
        let fully_closed = {
            let mut st = self.state.lock();
            if st.local_closed {
                return Ok(());
            }
            st.local_closed = true;
            if st.error.is_some() {
                return Ok(());
            }
            st.remote_closed
        };
        self.write_event.notify_waiters();
        self.read_event.notify_waiters();

        let fin = Frame::fin(self.config.version, self.id);
        tokio::select! {
            biased;
            _ = self.die.cancelled() => return Ok(()),
            r = self.frame_tx.send_async(fin) => {
                if r.is_err() {
                    return Ok(());
                }
            }
        }
        tracing::debug!(stream_id = self.id, "stream local half closed");

        if fully_closed {
            if let Some(session) = self.session.upgrade() {
                session.remove_stream(self.id);
            }
        }
        Ok(())
    }

    /// Drops the unread buffer once no user handle is left, and half-closes
    /// the stream if the user never did.
    fn release(self: &Arc<Self>) {
        let (freed, needs_fin) = {
            let mut st = self.state.lock();
            if st.released {
                return;
            }
            st.released = true;
            let freed = st.buffered;
            st.buffers.clear();
            st.buffered = 0;
            (freed, !st.local_closed && st.error.is_none())
        };

        if freed > 0 {
            if let Some(session) = self.session.upgrade() {
                session.release_receive_budget(freed);
            }
        }
        self.read_event.notify_waiters();
        self.write_event.notify_waiters();

        if needs_fin {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let shared = Arc::clone(self);
                    handle.spawn(async move {
                        let _ = shared.close().await;
                    });
                }
                Err(_) => {
                    tracing::debug!(stream_id = self.id, "no runtime to close dropped stream");
                }
            }
        }
    }

    /// Resolves once the stream is fully closed, released or dead.
    async fn wait_closed(&self) {
        loop {
            let notified = self.read_event.notified();
            {
                let st = self.state.lock();
                if st.released || st.state() == StreamState::Closed {
                    return;
                }
            }
            notified.await;
        }
    }

    // ---- deadlines ----

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.state.lock().read_deadline = deadline;
        self.read_event.notify_waiters();
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.state.lock().write_deadline = deadline;
        self.write_event.notify_waiters();
    }
}

fn window_size(config: &Config) -> u32 {
    config.max_stream_buffer.min(u32::MAX as usize) as u32
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Releases the stream when the last user handle goes away.
struct ReleaseGuard {
    shared: Arc<StreamShared>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// A multiplexed stream within a smux session.
///
/// Handles are cheap to clone and all refer to the same stream. Besides the
/// explicit [`recv`](Stream::recv)/[`send`](Stream::send) API, `Stream`
/// implements tokio's `AsyncRead` and `AsyncWrite`, so it can be used with
/// `read_exact`, `write_all`, `tokio::io::copy` and friends. Dropping the
/// last handle half-closes the stream and discards unread data.
pub struct Stream {
    shared: Arc<StreamShared>,
    _guard: Arc<ReleaseGuard>,
    read_wait: Option<BoxFuture<'static, ()>>,
    write_fut: Option<BoxFuture<'static, Result<usize>>>,
    close_fut: Option<BoxFuture<'static, Result<()>>>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        let guard = Arc::new(ReleaseGuard {
            shared: Arc::clone(&shared),
        });
        Self {
            shared,
            _guard: guard,
            read_wait: None,
            write_fut: None,
            close_fut: None,
        }
    }

    /// Get the stream ID
    pub fn stream_id(&self) -> u32 {
        self.shared.id()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Reads up to `buf.len()` bytes.
    ///
    /// The returned future owns its own reference to the stream, so it can
    /// be moved into a task while other handles keep being used.
    ///
    /// Blocks while nothing is buffered and the peer's half is open. Fails
    /// with [`SmuxError::EndOfStream`] once the peer closed its half and the
    /// buffer is drained, [`SmuxError::Timeout`] when the read deadline
    /// elapses, [`SmuxError::Closed`] after the handle was released, or the
    /// session's terminal cause once the session died.
    pub fn recv<'a>(&self, buf: &'a mut [u8]) -> impl Future<Output = Result<usize>> + Send + 'a {
        let shared = Arc::clone(&self.shared);
        async move { shared.read(buf).await }
    }

    /// Writes all of `buf`, fragmenting it into frames of at most
    /// `max_frame_size` bytes. In protocol v2 this waits for the peer's
    /// window.
    pub fn send(&self, buf: &[u8]) -> impl Future<Output = Result<usize>> + Send + 'static {
        self.send_bytes(Bytes::copy_from_slice(buf))
    }

    /// Like [`send`](Stream::send) without copying the payload.
    pub fn send_bytes(&self, data: Bytes) -> impl Future<Output = Result<usize>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        async move { shared.write_all(data).await }
    }

    /// Closes the local half. Idempotent: FIN is sent at most once.
    pub fn close(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        async move { shared.close().await }
    }

    /// Waits until both halves are closed or the session died.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        async move { shared.wait_closed().await }
    }

    /// Sets both the read and the write deadline. `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.set_read_deadline(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.set_write_deadline(deadline);
    }

    /// Bytes received and not yet read.
    pub fn buffered(&self) -> usize {
        self.shared.buffered()
    }
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _guard: Arc::clone(&self._guard),
            read_wait: None,
            write_fut: None,
            close_fut: None,
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("stream_id", &self.stream_id())
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.shared.try_read(buf.initialize_unfilled()) {
                Some(Ok(n)) => {
                    buf.advance(n);
                    this.read_wait = None;
                    return Poll::Ready(Ok(()));
                }
                Some(Err(SmuxError::EndOfStream)) => {
                    this.read_wait = None;
                    return Poll::Ready(Ok(()));
                }
                Some(Err(err)) => {
                    this.read_wait = None;
                    return Poll::Ready(Err(err.into()));
                }
                None => {
                    let shared = Arc::clone(&this.shared);
                    let wait = this
                        .read_wait
                        .get_or_insert_with(|| async move { shared.wait_readable().await }.boxed());
                    ready!(wait.as_mut().poll(cx));
                    this.read_wait = None;
                }
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if buf.is_empty() && this.write_fut.is_none() {
            return Poll::Ready(Ok(0));
        }

        let fut = this.write_fut.get_or_insert_with(|| {
            let shared = Arc::clone(&this.shared);
            let data = Bytes::copy_from_slice(buf);
            async move { shared.write_all(data).await }.boxed()
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.write_fut = None;
        Poll::Ready(result.map_err(Into::into))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer as soon as they are queued.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let fut = this.close_fut.get_or_insert_with(|| {
            let shared = Arc::clone(&this.shared);
            async move { shared.close().await }.boxed()
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.close_fut = None;
        Poll::Ready(result.map_err(Into::into))
    }
}
