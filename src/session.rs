use crate::{
    codec::Codec,
    command::Command,
    config::Config,
    error::{Result, SmuxError},
    frame::Frame,
    keepalive,
    shaper::Shaper,
    stream::{sleep_until_deadline, Pushed, Stream, StreamShared},
    stream_id::StreamIdGenerator,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{oneshot, Notify},
    time::Instant,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// A multiplexed session that manages multiple streams over a single connection
///
/// Handles are cheap to clone. Dropping the last handle closes the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    _guard: Arc<CloseGuard>,
}

/// Closes the session when the last user handle goes away. The background
/// tasks keep `SessionInner` alive on their own.
struct CloseGuard {
    inner: Arc<SessionInner>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.inner.die(SmuxError::SessionClosed);
    }
}

/// Internal session state shared between the background tasks and the
/// stream handles (which only hold a `Weak` to it).
pub(crate) struct SessionInner {
    config: Arc<Config>,
    /// Live streams keyed by stream ID
    streams: DashMap<u32, Arc<StreamShared>>,
    ids: StreamIdGenerator,
    /// Peer-opened streams waiting for `accept_stream`
    accept_tx: flume::Sender<Stream>,
    accept_rx: flume::Receiver<Stream>,
    accept_deadline: Mutex<Option<Instant>>,
    accept_event: Notify,
    /// Bounded queue drained by the writer task
    frame_tx: flume::Sender<Frame>,
    /// Unbounded lane for window updates and keep-alives
    ctrl_tx: flume::Sender<Frame>,
    die: CancellationToken,
    /// Cancelled once the writer task has let go of the carrier
    writer_done: CancellationToken,
    cause: Mutex<Option<SmuxError>>,
    /// Received bytes buffered in streams and not yet read
    recv_buffered: Mutex<usize>,
    /// Signalled whenever buffered bytes are released
    recv_event: Notify,
    last_activity: Mutex<Instant>,
    data_sent: AtomicBool,
    reader_paused: AtomicBool,
    boost_until: Instant,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("is_client", &self.inner.ids.is_client())
            .field("num_streams", &self.inner.streams.len())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

/// Channel ends handed to the writer task.
struct WriterQueues {
    frame_rx: flume::Receiver<Frame>,
    ctrl_rx: flume::Receiver<Frame>,
}

impl SessionInner {
    fn new(config: Config, is_client: bool) -> (Arc<Self>, WriterQueues) {
        let (frame_tx, frame_rx) = flume::bounded(config.write_queue_size);
        let (ctrl_tx, ctrl_rx) = flume::unbounded();
        let (accept_tx, accept_rx) = flume::bounded(config.accept_backlog);
        let now = Instant::now();

        let inner = Arc::new(Self {
            boost_until: now + config.boost_timeout,
            config: Arc::new(config),
            streams: DashMap::new(),
            ids: StreamIdGenerator::new(is_client),
            accept_tx,
            accept_rx,
            accept_deadline: Mutex::new(None),
            accept_event: Notify::new(),
            frame_tx,
            ctrl_tx,
            die: CancellationToken::new(),
            writer_done: CancellationToken::new(),
            cause: Mutex::new(None),
            recv_buffered: Mutex::new(0),
            recv_event: Notify::new(),
            last_activity: Mutex::new(now),
            data_sent: AtomicBool::new(false),
            reader_paused: AtomicBool::new(false),
        });

        (inner, WriterQueues { frame_rx, ctrl_rx })
    }

    /// A session core without background tasks, for unit tests that drive
    /// the queues by hand.
    #[cfg(test)]
    pub(crate) fn detached(
        config: Config,
        is_client: bool,
    ) -> (Arc<Self>, flume::Receiver<Frame>, flume::Receiver<Frame>) {
        let (inner, queues) = Self::new(config, is_client);
        (inner, queues.frame_rx, queues.ctrl_rx)
    }

    pub(crate) fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub(crate) fn frame_sender(&self) -> flume::Sender<Frame> {
        self.frame_tx.clone()
    }

    pub(crate) fn control_sender(&self) -> flume::Sender<Frame> {
        self.ctrl_tx.clone()
    }

    pub(crate) fn die_token(&self) -> CancellationToken {
        self.die.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.die.is_cancelled()
    }

    pub(crate) fn close_cause(&self) -> Option<SmuxError> {
        self.cause.lock().clone()
    }

    fn dead_error(&self) -> SmuxError {
        self.close_cause().unwrap_or(SmuxError::SessionClosed)
    }

    pub(crate) fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn insert_stream(&self, stream: Arc<StreamShared>) {
        self.streams.insert(stream.id(), stream);
    }

    pub(crate) fn remove_stream(&self, stream_id: u32) {
        if self.streams.remove(&stream_id).is_some() {
            tracing::debug!(stream_id, "stream removed");
        }
    }

    /// Enters the dead state. Only the first cause is kept; later calls are
    /// no-ops.
    pub(crate) fn die(&self, cause: SmuxError) {
        {
            let mut slot = self.cause.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(cause.clone());
        }

        match &cause {
            SmuxError::SessionClosed | SmuxError::CarrierEof => {
                tracing::debug!(%cause, "session closed")
            }
            _ => tracing::warn!(%cause, "session died"),
        }

        self.die.cancel();
        self.streams.retain(|_, stream| {
            stream.session_died(&cause);
            false
        });
        self.recv_event.notify_waiters();
        self.accept_event.notify_waiters();
    }

    /// Registers bytes that were handed to a stream buffer.
    #[cfg(test)]
    pub(crate) fn reserve_receive_budget(&self, n: usize) {
        *self.recv_buffered.lock() += n;
    }

    #[cfg(test)]
    pub(crate) fn receive_budget_used(&self) -> usize {
        *self.recv_buffered.lock()
    }

    /// Returns bytes read from (or discarded by) a stream to the session
    /// receive budget.
    pub(crate) fn release_receive_budget(&self, n: usize) {
        if n == 0 {
            return;
        }
        {
            let mut buffered = self.recv_buffered.lock();
            *buffered = buffered.saturating_sub(n);
        }
        self.recv_event.notify_waiters();
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub(crate) fn take_data_sent(&self) -> bool {
        self.data_sent.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_reader_paused(&self) -> bool {
        self.reader_paused.load(Ordering::Acquire)
    }

    /// The reader is blocked on local consumers, so peer silence says nothing
    /// about the peer.
    pub(crate) fn refresh_activity(&self) {
        self.touch();
    }

    fn boosting(&self) -> bool {
        Instant::now() < self.boost_until
    }

    /// Queues a frame on the bounded writer queue.
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.die.cancelled() => Err(self.dead_error()),
            r = self.frame_tx.send_async(frame) => r.map_err(|_| self.dead_error()),
        }
    }

    /// Queues the SYN of a locally opened stream, followed by its window
    /// advertisement in v2.
    async fn announce_stream(&self, stream: &StreamShared) -> Result<()> {
        self.send_frame(Frame::syn(self.config.version, stream.id()))
            .await?;
        if let Some(upd) = stream.window_advertisement() {
            self.send_frame(upd).await?;
        }
        Ok(())
    }

    /// Queues a frame on the control lane.
    pub(crate) fn send_control(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(self.dead_error());
        }
        self.ctrl_tx.send(frame).map_err(|_| self.dead_error())
    }

    /// Hands data to a stream and charges it to the receive budget.
    fn deliver(&self, stream: &StreamShared, data: Bytes) -> Result<Pushed> {
        let len = data.len();
        let mut buffered = self.recv_buffered.lock();
        let pushed = stream.push(data)?;
        if pushed == Pushed::Accepted {
            *buffered += len;
        }
        Ok(pushed)
    }

    fn has_receive_room(&self, stream: &StreamShared, len: usize) -> bool {
        // Dropped on arrival, so it takes no room
        if stream.is_discarding() {
            return true;
        }

        // `len` is bounded by `max_frame_size`, which never exceeds either
        // cap, so an empty buffer always has room.
        let total = *self.recv_buffered.lock();
        if total + len > self.config.max_receive_buffer {
            return false;
        }

        // Without windows the per-stream cap is enforced by not reading
        // the carrier.
        if self.config.per_stream_cap() && !self.config.windowed() {
            return stream.buffered() + len <= self.config.max_stream_buffer;
        }
        true
    }

    /// Pauses the reader until `len` more bytes fit in the receive buffers.
    async fn wait_receive_room(&self, stream: &StreamShared, len: usize) -> Result<()> {
        let mut paused = false;
        loop {
            let notified = self.recv_event.notified();
            if self.has_receive_room(stream, len) {
                break;
            }
            if !paused {
                paused = true;
                self.reader_paused.store(true, Ordering::Release);
                tracing::trace!(stream_id = stream.id(), len, "receive buffer full, pausing reader");
            }

            tokio::select! {
                _ = notified => {}
                _ = self.die.cancelled() => return Err(self.dead_error()),
            }
        }

        if paused {
            self.reader_paused.store(false, Ordering::Release);
            self.touch();
        }
        Ok(())
    }
}

impl Session {
    /// Create a new client session
    ///
    /// Validates `config`, takes ownership of `transport` and spawns the
    /// session tasks on the current tokio runtime.
    pub fn client<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, config, true)
    }

    /// Create a new server session
    pub fn server<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, config, false)
    }

    fn new<T>(transport: T, config: Config, is_client: bool) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let framed = Framed::new(transport, Codec::new(config.clone()));
        let (sink, stream) = framed.split();
        let (inner, queues) = SessionInner::new(config, is_client);

        tracing::debug!(
            is_client,
            version = inner.config.version,
            "session started"
        );

        tokio::spawn(recv_loop(stream, Arc::clone(&inner)));
        tokio::spawn(send_loop(sink, queues, Arc::clone(&inner)));
        if inner.config.enable_keep_alive {
            tokio::spawn(keepalive::keepalive_loop(Arc::clone(&inner)));
            tokio::spawn(keepalive::liveness_loop(Arc::clone(&inner)));
        }

        let guard = Arc::new(CloseGuard {
            inner: Arc::clone(&inner),
        });
        Ok(Session {
            inner,
            _guard: guard,
        })
    }

    /// Open a new outgoing stream
    ///
    /// The stream is registered before its SYN is queued, so data the peer
    /// sends back can never arrive for an unknown stream. Waits while the
    /// writer queue is full.
    ///
    /// The SYN is queued by a task of its own. If this future is dropped
    /// before it resolves, the stream is still announced and then closed
    /// like a dropped [`Stream`].
    pub async fn open_stream(&self) -> Result<Stream> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(inner.dead_error());
        }

        let stream_id = inner.ids.next()?;
        let shared = StreamShared::new(stream_id, inner);
        inner.insert_stream(Arc::clone(&shared));
        if inner.is_closed() {
            inner.remove_stream(stream_id);
            return Err(inner.dead_error());
        }

        let (opened_tx, opened_rx) = oneshot::channel();
        let announcer = Arc::clone(inner);
        tokio::spawn(async move {
            let announced = announcer.announce_stream(&shared).await;
            let opened = match announced {
                Ok(()) => Ok(Stream::new(shared)),
                Err(err) => {
                    announcer.remove_stream(stream_id);
                    Err(err)
                }
            };
            if let Err(Ok(stream)) = opened_tx.send(opened) {
                tracing::debug!(stream_id, "open abandoned by caller, closing stream");
                drop(stream);
            }
        });

        let stream = opened_rx.await.map_err(|_| inner.dead_error())??;
        tracing::debug!(stream_id, "stream opened");
        Ok(stream)
    }

    /// Accept an incoming stream initiated by the peer
    pub async fn accept_stream(&self) -> Result<Stream> {
        let inner = &self.inner;
        loop {
            let notified = inner.accept_event.notified();
            if inner.is_closed() {
                return Err(inner.dead_error());
            }
            let deadline = *inner.accept_deadline.lock();
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(SmuxError::Timeout);
            }

            tokio::select! {
                biased;
                _ = inner.die.cancelled() => return Err(inner.dead_error()),
                r = inner.accept_rx.recv_async() => {
                    return r.map_err(|_| inner.dead_error());
                }
                _ = notified => {}
                _ = sleep_until_deadline(deadline) => return Err(SmuxError::Timeout),
            }
        }
    }

    /// Sets the deadline for `accept_stream`. `None` clears it.
    pub fn set_accept_deadline(&self, deadline: Option<Instant>) {
        *self.inner.accept_deadline.lock() = deadline;
        self.inner.accept_event.notify_waiters();
    }

    /// Close the session
    ///
    /// Every live stream fails with [`SmuxError::SessionClosed`]. Frames
    /// already queued are still written, for at most `keep_alive_timeout`,
    /// then the carrier is shut down. Calling it again has no further
    /// effect.
    pub async fn close(&self) -> Result<()> {
        self.inner.die(SmuxError::SessionClosed);
        self.inner.writer_done.cancelled().await;
        Ok(())
    }

    /// Check if the session is closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Waits until the session dies and returns the cause.
    pub async fn closed(&self) -> SmuxError {
        self.inner.die.cancelled().await;
        self.inner.dead_error()
    }

    /// The terminal cause, once the session is dead.
    pub fn close_cause(&self) -> Option<SmuxError> {
        self.inner.close_cause()
    }

    /// Number of streams currently in the stream table.
    pub fn num_streams(&self) -> usize {
        self.inner.num_streams()
    }

    pub fn is_client(&self) -> bool {
        self.inner.ids.is_client()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

/// Background task that reads frames from the transport and dispatches them
async fn recv_loop<T>(mut reader: SplitStream<Framed<T, Codec>>, inner: Arc<SessionInner>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut dispatcher = Dispatcher {
        inner: &inner,
        max_peer_stream_id: 0,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = inner.die.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                inner.touch();
                if let Err(err) = dispatcher.handle_frame(frame).await {
                    if err.is_protocol_error() || matches!(err, SmuxError::FlowControlViolation(_)) {
                        tracing::error!(%err, "peer violated the protocol");
                    }
                    inner.die(err);
                    break;
                }
            }
            Some(Err(err)) => {
                tracing::error!(%err, "frame decode error");
                inner.die(err);
                break;
            }
            None => {
                tracing::info!("transport closed");
                inner.die(SmuxError::CarrierEof);
                break;
            }
        }
    }

    tracing::debug!("recv_loop exited");
}

/// Background task that writes frames to the transport
async fn send_loop<T>(
    mut sink: SplitSink<Framed<T, Codec>, Frame>,
    queues: WriterQueues,
    inner: Arc<SessionInner>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let _done = inner.writer_done.clone().drop_guard();
    let WriterQueues { frame_rx, ctrl_rx } = queues;
    let capacity = inner.config.write_queue_size;
    let mut shaper = Shaper::default();

    loop {
        while let Ok(frame) = ctrl_rx.try_recv() {
            shaper.push(frame);
        }
        while shaper.len() < capacity {
            match frame_rx.try_recv() {
                Ok(frame) => shaper.push(frame),
                Err(_) => break,
            }
        }

        let Some(frame) = shaper.pop() else {
            let received = tokio::select! {
                biased;
                _ = inner.die.cancelled() => break,
                r = ctrl_rx.recv_async() => r,
                r = frame_rx.recv_async() => r,
            };
            match received {
                Ok(frame) => shaper.push(frame),
                Err(_) => break,
            }
            continue;
        };

        let is_nop = frame.cmd == Command::Nop;
        let fed = tokio::select! {
            biased;
            _ = inner.die.cancelled() => break,
            r = sink.feed(frame) => r,
        };
        if let Err(err) = fed {
            tracing::error!(%err, "frame send error");
            inner.die(err);
            break;
        }
        if !is_nop {
            inner.data_sent.store(true, Ordering::Release);
        }

        // While boosting, frames are coalesced until the queues run dry.
        let idle = shaper.is_empty() && frame_rx.is_empty() && ctrl_rx.is_empty();
        if !inner.boosting() || idle {
            let flushed = tokio::select! {
                biased;
                _ = inner.die.cancelled() => break,
                r = sink.flush() => r,
            };
            if let Err(err) = flushed {
                tracing::error!(%err, "flush error");
                inner.die(err);
                break;
            }
        }
    }

    if matches!(inner.close_cause(), Some(SmuxError::SessionClosed)) {
        let drain = drain_queued(&mut sink, &mut shaper, &frame_rx, &ctrl_rx);
        match tokio::time::timeout(inner.config.keep_alive_timeout, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(%err, "failed to flush queued frames on close"),
            Err(_) => tracing::debug!("timed out flushing queued frames on close"),
        }
    }

    tracing::debug!("send_loop exited");
}

/// Writes out everything queued so far and shuts the write half down.
async fn drain_queued<T>(
    sink: &mut SplitSink<Framed<T, Codec>, Frame>,
    shaper: &mut Shaper,
    frame_rx: &flume::Receiver<Frame>,
    ctrl_rx: &flume::Receiver<Frame>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Ok(frame) = ctrl_rx.try_recv() {
        shaper.push(frame);
    }
    while let Ok(frame) = frame_rx.try_recv() {
        shaper.push(frame);
    }
    while let Some(frame) = shaper.pop() {
        sink.feed(frame).await?;
    }
    sink.close().await
}

/// Reader-side frame dispatch.
struct Dispatcher<'a> {
    inner: &'a Arc<SessionInner>,
    /// Highest stream ID the peer has opened; peer IDs only grow.
    max_peer_stream_id: u32,
}

impl Dispatcher<'_> {
    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.cmd {
            Command::Syn => self.handle_syn_frame(frame).await,
            Command::Fin => {
                self.handle_fin_frame(frame);
                Ok(())
            }
            Command::Psh => self.handle_psh_frame(frame).await,
            Command::Upd { consumed, window } => {
                if let Some(stream) = self.lookup(frame.stream_id) {
                    stream.update_window(consumed, window);
                }
                Ok(())
            }
            // Activity has already been recorded
            Command::Nop => Ok(()),
        }
    }

    fn lookup(&self, stream_id: u32) -> Option<Arc<StreamShared>> {
        self.inner
            .streams
            .get(&stream_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// SYN frame (new stream from peer)
    async fn handle_syn_frame(&mut self, frame: Frame) -> Result<()> {
        let inner = self.inner;
        let stream_id = frame.stream_id;

        inner.ids.validate_peer_stream_id(stream_id)?;
        if stream_id <= self.max_peer_stream_id || inner.streams.contains_key(&stream_id) {
            return Err(SmuxError::DuplicateStream(stream_id));
        }
        self.max_peer_stream_id = stream_id;

        let shared = StreamShared::new(stream_id, inner);
        inner.insert_stream(Arc::clone(&shared));
        if inner.is_closed() {
            inner.remove_stream(stream_id);
            return Err(inner.dead_error());
        }

        if let Some(upd) = shared.window_advertisement() {
            inner.send_control(upd)?;
        }

        let stream = Stream::new(shared);
        tokio::select! {
            biased;
            _ = inner.die.cancelled() => return Err(inner.dead_error()),
            r = inner.accept_tx.send_async(stream) => {
                r.map_err(|_| inner.dead_error())?;
            }
        }
        tracing::debug!(stream_id, "stream accepted from peer");
        Ok(())
    }

    /// FIN frame (peer closed its half)
    fn handle_fin_frame(&mut self, frame: Frame) {
        let stream_id = frame.stream_id;
        if let Some(stream) = self.lookup(stream_id) {
            tracing::debug!(stream_id, "stream remote half closed");
            if stream.remote_fin() {
                self.inner.remove_stream(stream_id);
            }
        }
    }

    /// PSH frame (data)
    async fn handle_psh_frame(&mut self, frame: Frame) -> Result<()> {
        let inner = self.inner;
        let stream_id = frame.stream_id;

        let Some(stream) = self.lookup(stream_id) else {
            return self.check_orphan_data(stream_id);
        };
        let len = frame.data.len();
        if len == 0 {
            return Ok(());
        }

        inner.wait_receive_room(&stream, len).await?;

        if inner.deliver(&stream, frame.data)? == Pushed::Discarded {
            tracing::trace!(stream_id, len, "discarding data for closed stream");
        }
        Ok(())
    }

    /// Data for a stream missing from the table is tolerated only if the
    /// stream existed before.
    fn check_orphan_data(&self, stream_id: u32) -> Result<()> {
        let inner = self.inner;
        let known = if inner.ids.is_local(stream_id) {
            inner.ids.is_allocated(stream_id)
        } else {
            stream_id <= self.max_peer_stream_id
        };

        if !known {
            return Err(SmuxError::ProtocolViolation(format!(
                "data for unopened stream {stream_id}"
            )));
        }
        tracing::trace!(stream_id, "discarding data for removed stream");
        Ok(())
    }
}
