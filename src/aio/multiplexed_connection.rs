use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{self, Poll};
use std::time::Duration;

use futures_util::{
    future::{Future, FutureExt},
    ready,
    sink::Sink,
    stream::{self, Stream, StreamExt},
};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::codec::Decoder;

use super::{setup_connection, AsyncConnectionConfig, ConnectionLike, PushSender};
use crate::caching::{CacheLookup, CacheManager};
use crate::cmd::Cmd;
use crate::commands::{command_keyword, is_cacheable, is_pubsub_allowed};
use crate::connection::ConnectionInfo;
use crate::parser::ValueCodec;
use crate::types::{
    closed_connection_error, ErrorKind, ProtocolVersion, PushInfo, PushKind, RedisError,
    RedisFuture, RedisResult, Value,
};

// Sender through which the result of a single request is delivered.
type RequestOutput = oneshot::Sender<RedisResult<Value>>;

enum ResponseAggregate {
    SingleCommand,
    Pipeline {
        // Responses to consume before collecting starts; inside a
        // transaction these are the MULTI ack and the QUEUED lines.
        skipped_response_count: usize,
        expected_response_count: usize,
        buffer: Vec<Value>,
        first_err: Option<RedisError>,
    },
}

impl ResponseAggregate {
    fn new(pipeline_response_counts: Option<(usize, usize)>) -> Self {
        match pipeline_response_counts {
            Some((skipped_response_count, expected_response_count)) => {
                ResponseAggregate::Pipeline {
                    skipped_response_count,
                    expected_response_count,
                    buffer: Vec::new(),
                    first_err: None,
                }
            }
            None => ResponseAggregate::SingleCommand,
        }
    }
}

struct InFlight {
    output: RequestOutput,
    response_aggregate: ResponseAggregate,
    // Holding the permit until resolution is what bounds the pipeline depth.
    _permit: tokio::sync::OwnedSemaphorePermit,
}

// A single request travelling from a connection handle to the driver.
struct RequestMessage {
    input: Vec<u8>,
    output: RequestOutput,
    // `None` for a plain command; `Some((skip, keep))` for a packed pipeline.
    pipeline_response_counts: Option<(usize, usize)>,
    permit: tokio::sync::OwnedSemaphorePermit,
}

// State shared between the handles and the driver.
struct SharedState {
    // Number of server-confirmed plus pending subscriptions; non-zero means
    // subscriber mode.
    subscription_count: AtomicUsize,
    resp3: AtomicBool,
}

fn send_push(push_sender: &Option<PushSender>, info: PushInfo) {
    if let Some(sender) = push_sender {
        let _ = sender.send(info);
    }
}

pub(crate) fn send_disconnect(push_sender: &Option<PushSender>) {
    send_push(
        push_sender,
        PushInfo {
            kind: PushKind::Disconnection,
            data: vec![],
        },
    );
}

// The RESP2 frames that belong to the subscription machinery rather than to
// the request/response queue.
fn resp2_subscription_kind(data: &[Value]) -> Option<PushKind> {
    if !(data.len() == 3 || data.len() == 4) {
        return None;
    }
    match data.first()?.as_bytes()? {
        b"message" => Some(PushKind::Message),
        b"pmessage" => Some(PushKind::PMessage),
        b"subscribe" => Some(PushKind::Subscribe),
        b"psubscribe" => Some(PushKind::PSubscribe),
        b"unsubscribe" => Some(PushKind::Unsubscribe),
        b"punsubscribe" => Some(PushKind::PUnsubscribe),
        _ => None,
    }
}

// Subscription acks carry the remaining subscription count as their last
// element; that count is what flips the connection out of subscriber mode.
fn update_subscription_count(shared: &SharedState, data: &[Value]) {
    if let Some(Value::Int(count)) = data.last() {
        shared
            .subscription_count
            .store((*count).max(0) as usize, Ordering::Relaxed);
    }
}

pin_project! {
    struct DriverSink<T> {
        #[pin]
        sink_stream: T,
        in_flight: VecDeque<InFlight>,
        error: Option<RedisError>,
        push_sender: Option<PushSender>,
        cache: Option<CacheManager>,
        shared: Arc<SharedState>,
    }
}

impl<T> DriverSink<T>
where
    T: Stream<Item = RedisResult<Value>> + 'static,
{
    fn new(
        sink_stream: T,
        push_sender: Option<PushSender>,
        cache: Option<CacheManager>,
        shared: Arc<SharedState>,
    ) -> Self
    where
        T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + 'static,
    {
        DriverSink {
            sink_stream,
            in_flight: VecDeque::new(),
            error: None,
            push_sender,
            cache,
            shared,
        }
    }

    // Read replies from the stream and resolve in-flight requests with them.
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Result<(), ()>> {
        loop {
            let item = ready!(self.as_mut().project().sink_stream.poll_next(cx));
            let item = match item {
                Some(result) => {
                    if let Err(err) = &result {
                        if err.is_unrecoverable_error() {
                            let self_ = self.as_mut().project();
                            send_disconnect(self_.push_sender);
                        }
                    }
                    result
                }
                // EOF: the server is not going to produce any more replies,
                // so the driver winds down and the handles learn about it.
                None => {
                    let self_ = self.project();
                    send_disconnect(self_.push_sender);
                    return Poll::Ready(Err(()));
                }
            };
            self.as_mut().handle_reply(item);
        }
    }

    fn handle_reply(self: Pin<&mut Self>, result: RedisResult<Value>) {
        let self_ = self.project();
        let result = match result {
            Ok(Value::Push { kind, data }) => {
                if kind == PushKind::Invalidate {
                    if let Some(cache) = self_.cache {
                        cache.handle_invalidation(&data);
                    }
                }
                if kind.has_reply() {
                    // Subscription acks double as the reply to the command
                    // that triggered them.
                    update_subscription_count(self_.shared, &data);
                    send_push(
                        self_.push_sender,
                        PushInfo {
                            kind: kind.clone(),
                            data: data.clone(),
                        },
                    );
                    Ok(Value::Push { kind, data })
                } else {
                    send_push(self_.push_sender, PushInfo { kind, data });
                    return;
                }
            }
            Ok(Value::Array(data))
                if !self_.shared.resp3.load(Ordering::Relaxed)
                    && resp2_subscription_kind(&data).is_some() =>
            {
                let kind = resp2_subscription_kind(&data).unwrap();
                match kind {
                    PushKind::Message | PushKind::PMessage => {
                        // Out-of-band payload; the queue is not touched.
                        send_push(
                            self_.push_sender,
                            PushInfo {
                                kind,
                                data: data[1..].to_vec(),
                            },
                        );
                        return;
                    }
                    _ => {
                        update_subscription_count(self_.shared, &data);
                        send_push(
                            self_.push_sender,
                            PushInfo {
                                kind,
                                data: data[1..].to_vec(),
                            },
                        );
                        if self_.in_flight.is_empty() {
                            // Acks for a multi-channel subscribe beyond the
                            // first have no queued request to resolve.
                            return;
                        }
                        Ok(Value::Array(data))
                    }
                }
            }
            _ => result,
        };

        let mut entry = match self_.in_flight.pop_front() {
            Some(entry) => entry,
            None => {
                log::warn!("Received a reply with no request in flight; dropping it");
                return;
            }
        };

        match &mut entry.response_aggregate {
            ResponseAggregate::SingleCommand => {
                entry.output.send(result).ok();
            }
            ResponseAggregate::Pipeline {
                skipped_response_count,
                expected_response_count,
                buffer,
                first_err,
            } => {
                if *skipped_response_count > 0 {
                    // Errors in skipped replies still abort the pipeline: a
                    // rejected QUEUED line means the transaction cannot
                    // commit.
                    if first_err.is_none() {
                        *first_err = result.and_then(Value::extract_error).err();
                    }

                    *skipped_response_count -= 1;
                    self_.in_flight.push_front(entry);
                    return;
                }

                match result {
                    Ok(item) => {
                        buffer.push(item);
                    }
                    Err(err) => {
                        if first_err.is_none() {
                            *first_err = Some(err);
                        }
                    }
                }

                if buffer.len() < *expected_response_count {
                    // Need to gather more response values.
                    self_.in_flight.push_front(entry);
                    return;
                }

                let response = match first_err.take() {
                    Some(err) => Err(err),
                    None => Ok(Value::Array(std::mem::take(buffer))),
                };

                // `Err` means the receiver was dropped in which case it does
                // not care about the output and the value can be dropped too.
                entry.output.send(response).ok();
            }
        }
    }
}

impl<T> Sink<RequestMessage> for DriverSink<T>
where
    T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + 'static,
{
    type Error = ();

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        match ready!(self.as_mut().project().sink_stream.poll_ready(cx)) {
            Ok(()) => Ok(()).into(),
            Err(err) => {
                *self.project().error = Some(err);
                Ok(()).into()
            }
        }
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        RequestMessage {
            input,
            output,
            pipeline_response_counts,
            permit,
        }: RequestMessage,
    ) -> Result<(), Self::Error> {
        // A caller that already gave up will never read the output; skip the
        // write entirely.
        if output.is_closed() {
            return Ok(());
        }

        let self_ = self.as_mut().project();

        if let Some(err) = self_.error.take() {
            let _ = output.send(Err(err));
            send_disconnect(self_.push_sender);
            return Err(());
        }

        match self_.sink_stream.start_send(input) {
            Ok(()) => {
                let entry = InFlight {
                    output,
                    response_aggregate: ResponseAggregate::new(pipeline_response_counts),
                    _permit: permit,
                };
                self_.in_flight.push_back(entry);
                Ok(())
            }
            Err(err) => {
                // A failed write fails its request and takes the connection
                // down with it.
                let _ = output.send(Err(err));
                send_disconnect(self_.push_sender);
                Err(())
            }
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        ready!(self
            .as_mut()
            .project()
            .sink_stream
            .poll_flush(cx)
            .map_err(|err| {
                self.as_mut().handle_reply(Err(err));
            }))?;
        self.poll_read(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        // No new requests will come in after the first call to `close` but
        // in-progress requests are still completed.
        if !self.in_flight.is_empty() {
            ready!(self.as_mut().poll_flush(cx))?;
        }
        let this = self.as_mut().project();
        this.sink_stream.poll_close(cx).map_err(|err| {
            self.handle_reply(Err(err));
        })
    }
}

// The handle-side sender for requests; the driver future does the IO.
#[derive(Clone)]
struct Dispatcher {
    sender: mpsc::UnboundedSender<RequestMessage>,
}

impl Dispatcher {
    fn new<T>(
        sink_stream: T,
        push_sender: Option<PushSender>,
        cache: Option<CacheManager>,
        shared: Arc<SharedState>,
    ) -> (Self, impl Future<Output = ()>)
    where
        T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>>,
        T: Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let sink = DriverSink::new(sink_stream, push_sender, cache, shared);
        let driver = stream::poll_fn(move |cx| receiver.poll_recv(cx))
            .map(Ok)
            .forward(sink)
            .map(|_| ());
        (Dispatcher { sender }, driver)
    }

    // `Err(None)` means the driver is gone.
    async fn send_recv(
        &self,
        input: Vec<u8>,
        pipeline_response_counts: Option<(usize, usize)>,
        permit: tokio::sync::OwnedSemaphorePermit,
        timeout: Option<Duration>,
    ) -> Result<Value, Option<RedisError>> {
        let (sender, receiver) = oneshot::channel();

        self.sender
            .send(RequestMessage {
                input,
                output: sender,
                pipeline_response_counts,
                permit,
            })
            .map_err(|_| None)?;

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(res) => res,
                Err(_) => {
                    return Err(Some(RedisError::from(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "Response timed out",
                    ))))
                }
            },
            None => receiver.await,
        };

        // The sender being dropped means the driver wound down mid-request.
        received.map_err(|_| None).and_then(|res| res.map_err(Some))
    }
}

/// A connection object which can be cloned, allowing requests to be sent
/// concurrently on the same underlying connection.
///
/// Requests are pipelined up to the configured depth and resolved strictly
/// in send order; push frames are demultiplexed to the configured push
/// sender and never consume a queue slot.  Cloning is cheap: all clones
/// share the driver task, the pipeline window and the subscriber state.
///
/// The connection is cancellation-safe: a dropped request future leaves its
/// queue slot in place and the eventual reply is discarded silently.  There
/// is no automatic reconnect; when the driver stops, every call fails and
/// the caller is expected to connect anew.
#[derive(Clone)]
pub struct MultiplexedConnection {
    dispatcher: Dispatcher,
    semaphore: Arc<Semaphore>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
    shared: Arc<SharedState>,
    cache: Option<CacheManager>,
    db: i64,
    protocol: ProtocolVersion,
    response_timeout: Option<Duration>,
}

impl fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("db", &self.db)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl MultiplexedConnection {
    /// Constructs a new `MultiplexedConnection` out of an
    /// `AsyncRead + AsyncWrite` object and a `ConnectionInfo`.  The returned
    /// driver future must be spawned for the connection to make progress.
    pub async fn new<C>(
        connection_info: &ConnectionInfo,
        stream: C,
    ) -> RedisResult<(Self, impl Future<Output = ()>)>
    where
        C: Unpin + AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new_with_config(connection_info, stream, AsyncConnectionConfig::new()).await
    }

    /// Like [`MultiplexedConnection::new`], with explicit configuration.
    pub async fn new_with_config<C>(
        connection_info: &ConnectionInfo,
        stream: C,
        config: AsyncConnectionConfig,
    ) -> RedisResult<(Self, impl Future<Output = ()>)>
    where
        C: Unpin + AsyncRead + AsyncWrite + Send + 'static,
    {
        fn boxed(
            f: impl Future<Output = ()> + Send + 'static,
        ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(f)
        }

        let redis_info = &connection_info.redis;
        if config.cache.is_some() && redis_info.protocol != ProtocolVersion::RESP3 {
            fail!((
                ErrorKind::InvalidClientConfig,
                "Client-side caching requires the resp3 protocol"
            ));
        }

        let cache = config.cache.map(CacheManager::new);
        let shared = Arc::new(SharedState {
            subscription_count: AtomicUsize::new(0),
            resp3: AtomicBool::new(redis_info.protocol == ProtocolVersion::RESP3),
        });

        let codec = ValueCodec::default().framed(stream);
        let (dispatcher, driver) = Dispatcher::new(
            codec,
            config.push_sender,
            cache.clone(),
            Arc::clone(&shared),
        );
        let driver = boxed(driver);

        let mut con = MultiplexedConnection {
            dispatcher,
            semaphore: Arc::new(Semaphore::new(config.pipeline_depth)),
            tx_lock: Arc::new(tokio::sync::Mutex::new(())),
            shared: Arc::clone(&shared),
            cache,
            db: redis_info.db,
            protocol: redis_info.protocol,
            response_timeout: config.response_timeout,
        };

        // The handshake needs the driver polling the socket, so the two are
        // raced until the setup future finishes.
        let tracking = con.cache.is_some();
        let (negotiated, driver) = {
            let setup = setup_connection(redis_info, &mut con, tracking);
            futures_util::pin_mut!(setup);

            match futures_util::future::select(setup, driver).await {
                futures_util::future::Either::Left((negotiated, driver)) => {
                    (negotiated?, driver)
                }
                futures_util::future::Either::Right(((), _)) => {
                    return Err(RedisError::from((
                        ErrorKind::IoError,
                        "Connection driver terminated during the handshake",
                    )));
                }
            }
        };
        con.protocol = negotiated;
        shared
            .resp3
            .store(negotiated == ProtocolVersion::RESP3, Ordering::Relaxed);
        Ok((con, driver))
    }

    /// The protocol version the server actually accepted.
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Sets the time to wait for responses before failing requests.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = Some(timeout);
    }

    fn check_subscriber_gate(&self, cmd: &Cmd) -> RedisResult<()> {
        // Gating applies to RESP2 only: with RESP3 the pubsub traffic is
        // carried by push frames and regular replies stay unambiguous.
        if self.protocol == ProtocolVersion::RESP3 {
            return Ok(());
        }
        if self.shared.subscription_count.load(Ordering::Relaxed) == 0 {
            return Ok(());
        }
        let keyword = command_keyword(
            cmd.arg_idx(0).unwrap_or_default(),
            cmd.arg_idx(1),
        );
        if is_pubsub_allowed(&keyword) {
            Ok(())
        } else {
            Err(RedisError::from((
                ErrorKind::SubscriptionMode,
                "Command is not allowed while the connection is in subscriber mode",
            )))
        }
    }

    async fn send_single(&mut self, cmd: &Cmd) -> RedisResult<Value> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| closed_connection_error())?;
        self.dispatcher
            .send_recv(
                cmd.get_packed_command(),
                None,
                permit,
                self.response_timeout,
            )
            .await
            .map_err(|err| err.unwrap_or_else(closed_connection_error))
    }

    /// Sends a command and reads its reply.  On a cache-enabled connection,
    /// cacheable reads are served locally when possible, and concurrent
    /// misses for the same `(command, key)` fingerprint collapse into a
    /// single server request.
    pub async fn send_packed_command(&mut self, cmd: &Cmd) -> RedisResult<Value> {
        self.check_subscriber_gate(cmd)?;

        let cache = match &self.cache {
            Some(cache) => cache.clone(),
            None => return self.send_single(cmd).await,
        };

        let keyword = command_keyword(cmd.arg_idx(0).unwrap_or_default(), cmd.arg_idx(1));
        let key = match cmd.arg_idx(1) {
            Some(key) if is_cacheable(cmd, &keyword) => key.to_vec(),
            _ => return self.send_single(cmd).await,
        };
        // The fingerprint is the full invocation, so reads that differ in
        // any argument never collide on one cache slot.
        let fingerprint = cmd.get_packed_command();

        match cache.lookup(&fingerprint, &key).await {
            CacheLookup::Hit(value) => Ok(value),
            CacheLookup::Failed(detail) => Err(RedisError::from((
                ErrorKind::ClientError,
                "Coalesced cache fetch failed",
                detail,
            ))),
            CacheLookup::Guard(guard) => {
                let result = self.send_single(cmd).await;
                match &result {
                    Ok(Value::ServerError(err)) => {
                        cache.fail(
                            &fingerprint,
                            &key,
                            guard,
                            err.details().unwrap_or("").to_string(),
                        );
                    }
                    Ok(value) => {
                        cache.complete(&fingerprint, &key, guard, value.clone());
                    }
                    Err(err) => {
                        cache.fail(&fingerprint, &key, guard, err.to_string());
                    }
                }
                result
            }
        }
    }

    /// Sends a packed pipeline and reads `count` replies after skipping
    /// `offset` of them.  Atomic pipelines (transactions) are serialized
    /// against each other: a new transaction waits for every predecessor on
    /// this connection to resolve first.
    pub async fn send_packed_pipeline(
        &mut self,
        pipeline: &crate::Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisResult<Vec<Value>> {
        for cmd in pipeline.cmd_iter() {
            self.check_subscriber_gate(cmd)?;
        }

        // A transaction occupies one window slot no matter how long its
        // body is; commands already committed to the server do not count
        // against the pipeline depth.
        let _tx_guard = if pipeline.is_transaction() {
            Some(self.tx_lock.clone().lock_owned().await)
        } else {
            None
        };

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| closed_connection_error())?;

        let value = self
            .dispatcher
            .send_recv(
                pipeline.get_packed_pipeline(),
                Some((offset, count)),
                permit,
                self.response_timeout,
            )
            .await
            .map_err(|err| err.unwrap_or_else(closed_connection_error))?;

        match value {
            Value::Array(values) => Ok(values),
            value => Ok(vec![value]),
        }
    }

    /// Subscribes to a channel on this connection.  Requires RESP3; with
    /// RESP2, use a dedicated [`super::PubSub`] connection instead.
    pub async fn subscribe(&mut self, channel_name: impl crate::ToRedisArgs) -> RedisResult<()> {
        super::check_resp3!(
            self.protocol,
            "Subscriptions on a shared connection require RESP3"
        );
        let mut cmd = crate::cmd("SUBSCRIBE");
        cmd.arg(channel_name);
        cmd.exec_async(self).await
    }

    /// Unsubscribes from a channel on this connection.  Requires RESP3.
    pub async fn unsubscribe(&mut self, channel_name: impl crate::ToRedisArgs) -> RedisResult<()> {
        super::check_resp3!(
            self.protocol,
            "Subscriptions on a shared connection require RESP3"
        );
        let mut cmd = crate::cmd("UNSUBSCRIBE");
        cmd.arg(channel_name);
        cmd.exec_async(self).await
    }
}

impl ConnectionLike for MultiplexedConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        (async move { self.send_packed_command(cmd).await }).boxed()
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a crate::Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        (async move { self.send_packed_pipeline(pipeline, offset, count).await }).boxed()
    }

    fn get_db(&self) -> i64 {
        self.db
    }
}
