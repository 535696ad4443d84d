//! One HTTP/2 connection: a single frame reader loop and a single frame
//! writer loop (§4.4), multiplexing many concurrent streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::error::RequestError;
use crate::ids::RequestId;
use crate::request::{Body, Request};
use crate::response::{ChannelBody, ProtocolTag, Response};

use super::super::common::{Connection, ConnectionState, Protocol};
use super::frame::{
    self, encode_frame, encode_ping, encode_rst_stream, encode_settings, encode_window_update, flags, hpack_decode,
    hpack_encode, parse_goaway, parse_settings, parse_window_update, try_parse_frame, FrameType, Setting,
    DEFAULT_MAX_CONCURRENT_STREAMS, SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_CONCURRENT_STREAMS,
};
use super::stream::StreamMachine;

const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const DEFAULT_INITIAL_WINDOW: i64 = 65_535;
/// §4.4: stream ids are odd and 31-bit; stop admitting new streams once the
/// remaining id space is this close to exhaustion.
const STREAM_ID_EXHAUSTION_MARGIN: u32 = 1000;

struct ActiveStream {
    machine: Mutex<StreamMachine>,
    head_tx: Mutex<Option<oneshot::Sender<Result<HeadParts, RequestError>>>>,
    body_tx: Mutex<Option<mpsc::Sender<Result<Bytes, RequestError>>>>,
    recv_window: AtomicI64,
}

struct HeadParts {
    status: http::StatusCode,
    headers: http::HeaderMap,
}

/// Bounds the number of concurrently open streams to the peer's advertised
/// `SETTINGS_MAX_CONCURRENT_STREAMS`, which can change over the connection's
/// lifetime — so a plain `Semaphore` (fixed at construction) doesn't fit.
struct StreamAdmission {
    active: AtomicU32,
    cap: AtomicU32,
    notify: Notify,
}

impl StreamAdmission {
    fn new(initial_cap: u32) -> Self {
        Self {
            active: AtomicU32::new(0),
            cap: AtomicU32::new(initial_cap),
            notify: Notify::new(),
        }
    }

    async fn acquire(&self) {
        loop {
            let cap = self.cap.load(Ordering::Acquire);
            let active = self.active.load(Ordering::Acquire);
            if active < cap {
                if self
                    .active
                    .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.notified().await;
        }
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn set_cap(&self, cap: u32) {
        self.cap.store(cap, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn has_capacity(&self) -> bool {
        self.active.load(Ordering::Acquire) < self.cap.load(Ordering::Acquire)
    }
}

struct Shared {
    streams: Mutex<HashMap<u32, Arc<ActiveStream>>>,
    admission: StreamAdmission,
    next_stream_id: AtomicU32,
    send_window: AtomicI64,
    send_window_notify: Notify,
    last_processed_stream_id: AtomicU32,
    goaway_received: AtomicBool,
    writer: mpsc::UnboundedSender<BytesMut>,
}

impl Shared {
    fn take_stream(&self, id: u32) -> Option<Arc<ActiveStream>> {
        self.streams.lock().expect("h2 streams poisoned").get(&id).cloned()
    }

    fn remove_stream(&self, id: u32) {
        self.streams.lock().expect("h2 streams poisoned").remove(&id);
    }
}

/// One HTTP/2 connection. Cheaply clonable: clones share the same reader
/// loop, writer loop, and stream table, so multiple callers can multiplex
/// concurrent requests over it.
#[derive(Clone)]
pub struct H2Connection {
    meta: Arc<Connection>,
    shared: Arc<Shared>,
    buffer_pool: Arc<crate::buffer::BufferPool>,
}

impl H2Connection {
    /// Perform the client preface + initial SETTINGS exchange and spawn the
    /// reader/writer loops. `io` is split so the two loops can run
    /// concurrently without a lock around the socket.
    pub async fn handshake<IO>(
        meta: Arc<Connection>,
        io: IO,
        buffer_pool: Arc<crate::buffer::BufferPool>,
    ) -> Result<Self, RequestError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug_assert_eq!(meta.protocol(), Protocol::H2);
        let (mut read_half, mut write_half) = split(io);
        let id = RequestId::connection_scoped();

        write_half
            .write_all(CLIENT_PREFACE)
            .await
            .map_err(|e| RequestError::connection(id, e.to_string()))?;
        write_half
            .write_all(&encode_settings(&[]))
            .await
            .map_err(|e| RequestError::connection(id, e.to_string()))?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<BytesMut>();
        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            admission: StreamAdmission::new(DEFAULT_MAX_CONCURRENT_STREAMS),
            next_stream_id: AtomicU32::new(1),
            send_window: AtomicI64::new(DEFAULT_INITIAL_WINDOW),
            send_window_notify: Notify::new(),
            last_processed_stream_id: AtomicU32::new(0),
            goaway_received: AtomicBool::new(false),
            writer: writer_tx,
        });

        spawn_writer_loop(write_half, writer_rx);
        spawn_reader_loop(Arc::clone(&shared), Arc::clone(&meta), read_half);

        Ok(Self {
            meta,
            shared,
            buffer_pool,
        })
    }

    pub fn meta(&self) -> &Arc<Connection> {
        &self.meta
    }

    /// Whether the connection currently has room to admit another stream
    /// without suspending, used by `HostPool`'s selection policy (§4.5).
    pub fn has_stream_capacity(&self) -> bool {
        self.shared.admission.has_capacity() && !self.shared.goaway_received.load(Ordering::Acquire)
    }

    /// Open a new stream and drive one request/response exchange on it.
    pub async fn send_request(&self, req: &Request, id: RequestId) -> Result<Response, RequestError> {
        self.meta.touch();
        self.shared.admission.acquire().await;
        let result = self.run_stream(req, id).await;
        self.shared.admission.release();
        result
    }

    async fn run_stream(&self, req: &Request, id: RequestId) -> Result<Response, RequestError> {
        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::AcqRel);
        if stream_id > u32::MAX - STREAM_ID_EXHAUSTION_MARGIN {
            self.meta.set_state(ConnectionState::Closing);
        }

        let mut machine = StreamMachine::new();
        enum BodyMode {
            None,
            Fixed(Bytes),
            Stream,
        }
        let body_mode = match req.body() {
            Body::Empty => BodyMode::None,
            Body::Bytes(b) => BodyMode::Fixed(b.clone()),
            Body::Stream(_) => BodyMode::Stream,
        };
        let end_stream_on_headers = match &body_mode {
            BodyMode::None => true,
            BodyMode::Fixed(b) => b.is_empty(),
            // Unknown until the stream is drained; the final DATA frame
            // carries END_STREAM instead (see `write_stream_body`).
            BodyMode::Stream => false,
        };
        machine.send_headers(end_stream_on_headers);

        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(32);
        let active = Arc::new(ActiveStream {
            machine: Mutex::new(machine),
            head_tx: Mutex::new(Some(head_tx)),
            body_tx: Mutex::new(Some(body_tx)),
            recv_window: AtomicI64::new(DEFAULT_INITIAL_WINDOW),
        });
        self.shared
            .streams
            .lock()
            .expect("h2 streams poisoned")
            .insert(stream_id, Arc::clone(&active));

        self.write_headers(req, stream_id, end_stream_on_headers, id)?;
        match body_mode {
            BodyMode::None => {}
            BodyMode::Fixed(body) if !body.is_empty() => {
                self.write_data(stream_id, &body, id).await?;
            }
            BodyMode::Fixed(_) => {}
            BodyMode::Stream => {
                self.write_stream_body(stream_id, req.body(), id).await?;
            }
        }

        let head = head_rx
            .await
            .map_err(|_| RequestError::connection(id, "h2 connection closed before response headers arrived"))??;

        let reason = head
            .status
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        Ok(Response::new(
            head.status,
            reason,
            head.headers,
            Box::new(ChannelBody::new(body_rx, id)),
            std::time::Duration::default(),
            ProtocolTag::H2,
            req.url().clone(),
        ))
    }

    fn write_headers(&self, req: &Request, stream_id: u32, end_stream: bool, id: RequestId) -> Result<(), RequestError> {
        let mut pseudo = vec![
            (":method".to_string(), req.method().as_str().to_string()),
            (":scheme".to_string(), req.url().scheme_str().unwrap_or("https").to_string()),
        ];
        if let Some(authority) = req.url().authority() {
            pseudo.push((":authority".to_string(), authority.as_str().to_string()));
        }
        pseudo.push((
            ":path".to_string(),
            req.url().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string()),
        ));
        for (name, value) in req.headers().iter() {
            if let Ok(v) = value.to_str() {
                pseudo.push((name.as_str().to_string(), v.to_string()));
            }
        }

        let block = hpack_encode(&pseudo);
        let mut flag_bits = flags::END_HEADERS;
        if end_stream {
            flag_bits |= flags::END_STREAM;
        }
        let frame = encode_frame(FrameType::Headers, flag_bits, stream_id, &block);
        self.shared
            .writer
            .send(frame)
            .map_err(|_| RequestError::connection(id, "h2 writer loop has shut down"))
    }

    /// Park until at least one byte of send window is available, then debit
    /// up to `want` bytes from it. Mirrors `StreamAdmission::acquire`'s
    /// compare-exchange-then-wait loop, parked on `send_window_notify`
    /// instead of `admission.notify`.
    async fn reserve_send_window(&self, want: i64) -> usize {
        loop {
            let current = self.shared.send_window.load(Ordering::Acquire);
            if current <= 0 {
                self.shared.send_window_notify.notified().await;
                continue;
            }
            let take = want.min(current);
            if self
                .shared
                .send_window
                .compare_exchange(current, current - take, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return take as usize;
            }
        }
    }

    fn send_data_frame(&self, stream_id: u32, payload: &[u8], end_stream: bool, id: RequestId) -> Result<(), RequestError> {
        let flag_bits = if end_stream { flags::END_STREAM } else { 0 };
        let frame = encode_frame(FrameType::Data, flag_bits, stream_id, payload);
        self.shared
            .writer
            .send(frame)
            .map_err(|_| RequestError::connection(id, "h2 writer loop has shut down"))
    }

    /// Write a fixed body as one or more DATA frames, honoring the peer's
    /// advertised send window (§4.4/§5) and splitting across frames when the
    /// window doesn't cover the whole body.
    async fn write_data(&self, stream_id: u32, body: &Bytes, id: RequestId) -> Result<(), RequestError> {
        let mut offset = 0usize;
        while offset < body.len() {
            let remaining = (body.len() - offset) as i64;
            let granted = self.reserve_send_window(remaining).await;
            let end = offset + granted;
            let is_last = end == body.len();
            self.send_data_frame(stream_id, &body[offset..end], is_last, id)?;
            offset = end;
        }
        Ok(())
    }

    /// Drain a streamed request body chunk by chunk, pulling from
    /// `RewindableBody::next_chunk` and honoring send-window flow control on
    /// each DATA frame. The final, empty DATA frame carries `END_STREAM`
    /// since the stream's length isn't known up front.
    async fn write_stream_body(&self, stream_id: u32, body: &Body, id: RequestId) -> Result<(), RequestError> {
        while let Some(chunk) = body.next_stream_chunk() {
            if chunk.is_empty() {
                continue;
            }
            let mut offset = 0usize;
            while offset < chunk.len() {
                let remaining = (chunk.len() - offset) as i64;
                let granted = self.reserve_send_window(remaining).await;
                let end = offset + granted;
                self.send_data_frame(stream_id, &chunk[offset..end], false, id)?;
                offset = end;
            }
        }
        self.send_data_frame(stream_id, &[], true, id)
    }

    /// Cancellation (§5): send `RST_STREAM(CANCEL)` and fail any local
    /// handle waiting on this stream. A no-op if the stream already
    /// completed and was removed from the table.
    pub fn cancel_stream(&self, stream_id: u32, id: RequestId) {
        const CANCEL: u32 = 0x8;
        let _ = self.shared.writer.send(encode_rst_stream(stream_id, CANCEL));
        if let Some(stream) = self.shared.take_stream(stream_id) {
            fail_stream(&stream, RequestError::cancelled(id));
            self.shared.remove_stream(stream_id);
        }
    }
}

fn spawn_writer_loop<W>(mut write_half: WriteHalf<W>, mut rx: mpsc::UnboundedReceiver<BytesMut>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });
}

fn spawn_reader_loop<R>(shared: Arc<Shared>, meta: Arc<Connection>, mut read_half: ReadHalf<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        let mut scratch = [0u8; 16 * 1024];
        let conn_id = RequestId::connection_scoped();
        loop {
            let frame = match try_parse_frame(&mut buf, conn_id) {
                Ok(Some(frame)) => frame,
                Ok(None) => match read_half.read(&mut scratch).await {
                    Ok(0) => {
                        meta.set_state(ConnectionState::Closed);
                        break;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&scratch[..n]);
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "h2 reader loop: socket error");
                        meta.set_state(ConnectionState::Broken);
                        break;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "h2 reader loop: framing error");
                    meta.set_state(ConnectionState::Broken);
                    break;
                }
            };
            handle_frame(&shared, &meta, frame, conn_id);
        }
    });
}

fn handle_frame(shared: &Arc<Shared>, meta: &Arc<Connection>, frame: frame::RawFrame, conn_id: RequestId) {
    let Some(frame_type) = frame.frame_type else {
        trace!(stream_id = frame.stream_id, "ignoring unknown h2 frame type");
        return;
    };
    match frame_type {
        FrameType::Settings => {
            if frame.flags & flags::ACK != 0 {
                return;
            }
            for Setting { id: sid, value } in parse_settings(&frame.payload) {
                if sid == SETTINGS_MAX_CONCURRENT_STREAMS {
                    shared.admission.set_cap(value);
                } else if sid == SETTINGS_INITIAL_WINDOW_SIZE {
                    shared.send_window.store(value as i64, Ordering::Release);
                    shared.send_window_notify.notify_waiters();
                }
            }
            let _ = shared.writer.send(encode_frame(FrameType::Settings, flags::ACK, 0, &[]));
        }
        FrameType::Ping => {
            if frame.flags & flags::ACK == 0 {
                let mut data = [0u8; 8];
                let n = frame.payload.len().min(8);
                data[..n].copy_from_slice(&frame.payload[..n]);
                let _ = shared.writer.send(encode_ping(true, data));
            }
        }
        FrameType::GoAway => {
            let goaway = parse_goaway(&frame.payload);
            shared.last_processed_stream_id.store(goaway.last_stream_id, Ordering::Release);
            shared.goaway_received.store(true, Ordering::Release);
            meta.set_state(ConnectionState::Closing);
            debug!(last_stream_id = goaway.last_stream_id, "received GOAWAY");

            // Streams above the server's last-processed id were never acted
            // on; fail them distinctly so the retry engine can treat the
            // failure as provably pre-processing regardless of idempotency.
            let unprocessed: Vec<Arc<ActiveStream>> = shared
                .streams
                .lock()
                .expect("h2 streams poisoned")
                .iter()
                .filter(|(id, _)| **id > goaway.last_stream_id)
                .map(|(_, stream)| Arc::clone(stream))
                .collect();
            for stream in &unprocessed {
                fail_stream(stream, RequestError::not_processed_by_peer(conn_id));
            }
            shared.streams.lock().expect("h2 streams poisoned").retain(|id, _| *id <= goaway.last_stream_id);
        }
        FrameType::WindowUpdate => {
            let increment = parse_window_update(&frame.payload) as i64;
            if frame.stream_id == 0 {
                shared.send_window.fetch_add(increment, Ordering::AcqRel);
                shared.send_window_notify.notify_waiters();
            }
            // Only the connection-level window is tracked and enforced (in
            // `write_data`/`write_stream_body`); a stream-level WINDOW_UPDATE
            // would feed a per-stream budget this client doesn't keep.
        }
        FrameType::Headers => {
            if let Some(stream) = shared.take_stream(frame.stream_id) {
                handle_headers(&stream, &frame, conn_id);
            }
        }
        FrameType::Data => {
            if let Some(stream) = shared.take_stream(frame.stream_id) {
                handle_data(shared, &stream, frame.stream_id, &frame, conn_id);
            }
        }
        FrameType::RstStream => {
            if let Some(stream) = shared.take_stream(frame.stream_id) {
                stream.machine.lock().expect("h2 stream poisoned").recv_rst();
                fail_stream(&stream, RequestError::connection(conn_id, "stream reset by peer"));
                shared.remove_stream(frame.stream_id);
            }
        }
        FrameType::Continuation => {
            trace!("continuation frames are not emitted by this client's HEADERS encoder and are ignored on receipt");
        }
    }
}

fn handle_headers(stream: &Arc<ActiveStream>, frame: &frame::RawFrame, conn_id: RequestId) {
    let end_stream = frame.flags & flags::END_STREAM != 0;
    let decoded = match hpack_decode(&frame.payload, conn_id) {
        Ok(h) => h,
        Err(e) => {
            fail_stream(stream, e);
            return;
        }
    };
    let mut status = http::StatusCode::OK;
    let mut headers = http::HeaderMap::new();
    for (name, value) in decoded {
        if name == ":status" {
            status = value.parse().unwrap_or(http::StatusCode::OK);
            continue;
        }
        if name.starts_with(':') {
            continue;
        }
        if let (Ok(name), Ok(value)) = (http::HeaderName::from_bytes(name.as_bytes()), http::HeaderValue::from_str(&value)) {
            headers.append(name, value);
        }
    }

    if let Some(tx) = stream.head_tx.lock().expect("h2 stream poisoned").take() {
        let _ = tx.send(Ok(HeadParts { status, headers }));
    }
    stream.machine.lock().expect("h2 stream poisoned").recv_end_stream_if(end_stream);
    if end_stream {
        if let Some(tx) = stream.body_tx.lock().expect("h2 stream poisoned").take() {
            drop(tx);
        }
    }
}

fn handle_data(shared: &Arc<Shared>, stream: &Arc<ActiveStream>, stream_id: u32, frame: &frame::RawFrame, _conn_id: RequestId) {
    let end_stream = frame.flags & flags::END_STREAM != 0;
    let len = frame.payload.len() as i64;
    stream.recv_window.fetch_sub(len, Ordering::AcqRel);

    if let Some(tx) = stream.body_tx.lock().expect("h2 stream poisoned").clone() {
        let _ = tx.try_send(Ok(frame.payload.clone()));
    }
    if stream.recv_window.load(Ordering::Acquire) < DEFAULT_INITIAL_WINDOW / 2 {
        let _ = shared.writer.send(encode_window_update(stream_id, DEFAULT_INITIAL_WINDOW as u32));
        stream.recv_window.fetch_add(DEFAULT_INITIAL_WINDOW, Ordering::AcqRel);
    }

    stream.machine.lock().expect("h2 stream poisoned").recv_end_stream_if(end_stream);
    if end_stream {
        if let Some(tx) = stream.body_tx.lock().expect("h2 stream poisoned").take() {
            drop(tx);
        }
        shared.remove_stream(stream_id);
    }
}

fn fail_stream(stream: &Arc<ActiveStream>, err: RequestError) {
    if let Some(tx) = stream.head_tx.lock().expect("h2 stream poisoned").take() {
        let _ = tx.send(Err(clone_err(&err)));
    }
    if let Some(tx) = stream.body_tx.lock().expect("h2 stream poisoned").take() {
        let _ = tx.try_send(Err(err));
    }
}

/// `RequestError` doesn't derive `Clone` (it isn't needed on the happy
/// path); failing both the head and body channels needs two values.
fn clone_err(err: &RequestError) -> RequestError {
    match err.request_id() {
        Some(id) => RequestError::connection(id, err.to_string()),
        None => RequestError::validation(err.to_string()),
    }
}

impl StreamMachine {
    fn recv_end_stream_if(&mut self, end_stream: bool) {
        if end_stream {
            self.recv_end_stream();
        }
    }
}
