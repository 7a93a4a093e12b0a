use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{self, Poll};

use futures_util::{
    future::{Future, FutureExt},
    ready,
    sink::{Sink, SinkExt},
    stream::{self, Stream, StreamExt},
};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::codec::Decoder;

use super::{setup_connection, ConnectionLike};
use crate::cmd::cmd;
use crate::parser::ValueCodec;
use crate::types::{
    closed_connection_error, Msg, RedisError, RedisFuture, RedisResult, ToRedisArgs, Value,
};
use crate::ConnectionInfo;

// A signal that an (un)subscribe request has completed.
type AckSender = oneshot::Sender<RedisResult<Value>>;

// A single request sent through the sink.
struct SinkMessage {
    input: Vec<u8>,
    output: AckSender,
}

// The per-connection routing tables: channel name or pattern to the sinks of
// the subscriptions listening on it.  Listeners whose stream was dropped are
// pruned on the next dispatch.
#[derive(Default)]
struct Registry {
    channels: HashMap<Vec<u8>, Vec<UnboundedSender<Msg>>>,
    patterns: HashMap<Vec<u8>, Vec<UnboundedSender<Msg>>>,
}

impl Registry {
    fn dispatch(&mut self, msg: Msg) {
        let (table, key) = if msg.from_pattern() {
            let Some(pattern) = msg.get_pattern_bytes().map(<[u8]>::to_vec) else {
                return;
            };
            (&mut self.patterns, pattern)
        } else {
            (&mut self.channels, msg.get_channel_bytes().to_vec())
        };

        match table.get_mut(&key) {
            Some(listeners) => {
                listeners.retain(|listener| listener.send(msg.clone()).is_ok());
            }
            None => {
                log::debug!(
                    "Dropping message for unknown channel {:?}",
                    String::from_utf8_lossy(&key)
                );
            }
        }
    }

    // Completes every subscription stream; used when the connection goes
    // away.
    fn clear(&mut self) {
        self.channels.clear();
        self.patterns.clear();
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

/// A stream of the messages received on one channel or pattern
/// subscription.
///
/// The stream ends when the subscription is cancelled through
/// [`PubSub::unsubscribe`]/[`PubSub::punsubscribe`] or when the connection
/// closes.  Dropping it merely stops delivery to this listener; the server
/// side subscription stays until explicitly removed.
pub struct Subscription {
    receiver: UnboundedReceiver<Msg>,
}

impl Stream for Subscription {
    type Item = Msg;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Msg>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Subscription {
    /// Receives the next message on this subscription, or `None` once the
    /// subscription is gone.
    pub async fn next_message(&mut self) -> Option<Msg> {
        self.receiver.recv().await
    }
}

pin_project! {
    struct PubSubDriver<T> {
        #[pin]
        sink_stream: T,
        // Acks are strictly ordered, so a FIFO pairs them with requests.
        in_flight: std::collections::VecDeque<AckSender>,
        registry: SharedRegistry,
    }
}

impl<T> PubSubDriver<T>
where
    T: Stream<Item = RedisResult<Value>> + 'static,
{
    fn handle_message(self: Pin<&mut Self>, result: RedisResult<Value>) -> Result<(), ()> {
        let self_ = self.project();

        match result {
            Ok(Value::Array(data)) => {
                if let Some(kind) = data.first().and_then(Value::as_bytes) {
                    if matches!(
                        kind,
                        b"subscribe" | b"psubscribe" | b"unsubscribe" | b"punsubscribe" | b"pong"
                    ) {
                        if let Some(entry) = self_.in_flight.pop_front() {
                            let _ = entry.send(Ok(Value::Array(data)));
                        }
                        return Ok(());
                    }
                }

                match Msg::from_owned_value(Value::Array(data)) {
                    Some(msg) => {
                        self_.registry.lock().unwrap().dispatch(msg);
                        Ok(())
                    }
                    None => Err(()),
                }
            }

            Ok(Value::Push { kind, data }) => {
                if kind.has_reply() {
                    if let Some(entry) = self_.in_flight.pop_front() {
                        let _ = entry.send(Ok(Value::Push { kind, data }));
                    }
                    return Ok(());
                }

                if let Some(msg) = Msg::from_push_info(crate::types::PushInfo { kind, data }) {
                    self_.registry.lock().unwrap().dispatch(msg);
                }
                Ok(())
            }

            Err(err) if err.is_unrecoverable_error() => Err(()),

            // Everything else (PONG simple strings, error lines) answers the
            // request at the head of the queue.
            _ => {
                if let Some(entry) = self_.in_flight.pop_front() {
                    let _ = entry.send(result);
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Result<(), ()>> {
        loop {
            let item = match ready!(self.as_mut().project().sink_stream.poll_next(cx)) {
                Some(result) => result,
                None => return Poll::Ready(Err(())),
            };
            self.as_mut().handle_message(item)?;
        }
    }
}

impl<T> Sink<SinkMessage> for PubSubDriver<T>
where
    T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + 'static,
{
    type Error = ();

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        self.as_mut()
            .project()
            .sink_stream
            .poll_ready(cx)
            .map_err(|_| ())
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        SinkMessage { input, output }: SinkMessage,
    ) -> Result<(), Self::Error> {
        let self_ = self.as_mut().project();

        match self_.sink_stream.start_send(input) {
            Ok(()) => {
                self_.in_flight.push_back(output);
                Ok(())
            }
            Err(err) => {
                let _ = output.send(Err(err));
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
                let _ = self.as_mut().handle_message(Err(err));
            }))?;
        self.poll_read(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        if !self.in_flight.is_empty() {
            ready!(self.as_mut().poll_flush(cx))?;
        }
        self.project().sink_stream.poll_close(cx).map_err(|_| ())
    }
}

/// The request half of a pubsub connection, used to change subscriptions.
///
/// It is cheap to clone; all clones share the connection and its
/// subscription registry.
#[derive(Clone)]
pub struct PubSubSink {
    sender: UnboundedSender<SinkMessage>,
    registry: SharedRegistry,
}

impl PubSubSink {
    fn new<T>(sink_stream: T, registry: SharedRegistry) -> (Self, impl Future<Output = ()>)
    where
        T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>>,
        T: Unpin + Send + 'static,
    {
        let (sender, mut receiver) = unbounded_channel();
        let driver = PubSubDriver {
            sink_stream,
            in_flight: Default::default(),
            registry: Arc::clone(&registry),
        };
        let registry_for_close = Arc::clone(&registry);
        let driver = stream::poll_fn(move |cx| receiver.poll_recv(cx))
            .map(Ok)
            .forward(driver)
            .map(move |_| {
                // Connection gone: complete every subscription stream.
                registry_for_close.lock().unwrap().clear();
            });
        (PubSubSink { sender, registry }, driver)
    }

    async fn send_recv(&mut self, input: Vec<u8>) -> RedisResult<Value> {
        let (sender, receiver) = oneshot::channel();

        self.sender
            .send(SinkMessage {
                input,
                output: sender,
            })
            .map_err(|_| closed_connection_error())?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(closed_connection_error()),
        }
    }

    fn single_arg(what: &str, value: impl ToRedisArgs) -> RedisResult<Vec<u8>> {
        let mut args = value.to_redis_args();
        if args.len() != 1 {
            fail!((
                crate::types::ErrorKind::ClientError,
                "Expected exactly one argument",
                what.to_string()
            ));
        }
        Ok(args.pop().unwrap())
    }

    /// Subscribes to a channel and returns its message stream.
    ///
    /// Subscribing twice to the same channel is idempotent on the wire: the
    /// `SUBSCRIBE` command is only sent for a channel this connection does
    /// not listen on yet, and each call returns a fresh stream fed by the
    /// same subscription.
    pub async fn subscribe(&mut self, channel: impl ToRedisArgs) -> RedisResult<Subscription> {
        let name = Self::single_arg("channel", channel)?;
        let (tx, rx) = unbounded_channel();

        let needs_wire_subscribe = {
            let mut registry = self.registry.lock().unwrap();
            let listeners = registry.channels.entry(name.clone()).or_default();
            let was_empty = listeners.is_empty();
            listeners.push(tx);
            was_empty
        };

        if needs_wire_subscribe {
            let command = cmd("SUBSCRIBE").arg(name.as_slice()).get_packed_command();
            if let Err(err) = self.send_recv(command).await {
                self.registry.lock().unwrap().channels.remove(&name);
                return Err(err);
            }
        }

        Ok(Subscription { receiver: rx })
    }

    /// Subscribes to a pattern and returns its message stream.  Idempotent
    /// like [`PubSubSink::subscribe`].
    pub async fn psubscribe(&mut self, pattern: impl ToRedisArgs) -> RedisResult<Subscription> {
        let name = Self::single_arg("pattern", pattern)?;
        let (tx, rx) = unbounded_channel();

        let needs_wire_subscribe = {
            let mut registry = self.registry.lock().unwrap();
            let listeners = registry.patterns.entry(name.clone()).or_default();
            let was_empty = listeners.is_empty();
            listeners.push(tx);
            was_empty
        };

        if needs_wire_subscribe {
            let command = cmd("PSUBSCRIBE").arg(name.as_slice()).get_packed_command();
            if let Err(err) = self.send_recv(command).await {
                self.registry.lock().unwrap().patterns.remove(&name);
                return Err(err);
            }
        }

        Ok(Subscription { receiver: rx })
    }

    /// Unsubscribes from a channel.  The ack completes every stream that was
    /// returned for it.
    pub async fn unsubscribe(&mut self, channel: impl ToRedisArgs) -> RedisResult<()> {
        let name = Self::single_arg("channel", channel)?;
        let command = cmd("UNSUBSCRIBE").arg(name.as_slice()).get_packed_command();
        self.send_recv(command).await?;
        self.registry.lock().unwrap().channels.remove(&name);
        Ok(())
    }

    /// Unsubscribes from a pattern, completing its streams.
    pub async fn punsubscribe(&mut self, pattern: impl ToRedisArgs) -> RedisResult<()> {
        let name = Self::single_arg("pattern", pattern)?;
        let command = cmd("PUNSUBSCRIBE")
            .arg(name.as_slice())
            .get_packed_command();
        self.send_recv(command).await?;
        self.registry.lock().unwrap().patterns.remove(&name);
        Ok(())
    }

    /// Pings the server over the pubsub connection.
    pub async fn ping(&mut self) -> RedisResult<()> {
        self.send_recv(cmd("PING").get_packed_command()).await?;
        Ok(())
    }
}

/// A connection dedicated to pubsub messages.
///
/// While the counterpart connection types refuse pubsub under RESP2, this
/// connection never carries regular commands, so it supports subscriptions
/// under both protocol versions.
pub struct PubSub {
    sink: PubSubSink,
}

impl PubSub {
    /// Constructs a new `PubSub` out of an `AsyncRead + AsyncWrite` object
    /// and a `ConnectionInfo`.  The returned driver future must be spawned
    /// for the connection to make progress.
    pub async fn new<C>(
        connection_info: &ConnectionInfo,
        stream: C,
    ) -> RedisResult<(Self, impl Future<Output = ()>)>
    where
        C: Unpin + AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut codec = HandshakeConnection {
            codec: ValueCodec::default().framed(stream),
        };
        setup_connection(&connection_info.redis, &mut codec, false).await?;

        let registry: SharedRegistry = Default::default();
        let (sink, driver) = PubSubSink::new(codec.codec, registry);
        Ok((PubSub { sink }, driver))
    }

    /// Subscribes to a channel and returns its message stream.
    pub async fn subscribe(&mut self, channel: impl ToRedisArgs) -> RedisResult<Subscription> {
        self.sink.subscribe(channel).await
    }

    /// Subscribes to a pattern and returns its message stream.
    pub async fn psubscribe(&mut self, pattern: impl ToRedisArgs) -> RedisResult<Subscription> {
        self.sink.psubscribe(pattern).await
    }

    /// Unsubscribes from a channel, completing its streams.
    pub async fn unsubscribe(&mut self, channel: impl ToRedisArgs) -> RedisResult<()> {
        self.sink.unsubscribe(channel).await
    }

    /// Unsubscribes from a pattern, completing its streams.
    pub async fn punsubscribe(&mut self, pattern: impl ToRedisArgs) -> RedisResult<()> {
        self.sink.punsubscribe(pattern).await
    }

    /// Pings the server over the pubsub connection.
    pub async fn ping(&mut self) -> RedisResult<()> {
        self.sink.ping().await
    }

    /// Returns a clonable handle for changing subscriptions from elsewhere.
    pub fn sink(&self) -> PubSubSink {
        self.sink.clone()
    }
}

// Runs the connection handshake directly over the framed codec, before the
// driver task takes the stream over.
struct HandshakeConnection<T> {
    codec: T,
}

impl<T> ConnectionLike for HandshakeConnection<T>
where
    T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + Unpin + Send,
{
    fn req_packed_command<'a>(&'a mut self, cmd: &'a crate::Cmd) -> RedisFuture<'a, Value> {
        (async move {
            self.codec.send(cmd.get_packed_command()).await?;
            match self.codec.next().await {
                Some(result) => result,
                None => Err(closed_connection_error()),
            }
        })
        .boxed()
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a crate::Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        (async move {
            self.codec.send(pipeline.get_packed_pipeline()).await?;
            let mut results = Vec::with_capacity(offset + count);
            for _ in 0..offset + count {
                match self.codec.next().await {
                    Some(result) => results.push(result?),
                    None => return Err(closed_connection_error()),
                }
            }
            Ok(results.split_off(offset))
        })
        .boxed()
    }

    fn get_db(&self) -> i64 {
        0
    }
}
