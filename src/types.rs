use std::error;
use std::fmt;
use std::io;
use std::str::{from_utf8, Utf8Error};
use std::string::FromUtf8Error;

use num_bigint::BigInt;

macro_rules! invalid_type_error {
    ($v:expr, $det:expr) => {{
        fail!(RedisError::from((
            ErrorKind::TypeError,
            "Response was of incompatible type",
            format!("{:?} (response was {:?})", $det, $v),
        )))
    }};
}

/// Which version of the RESP protocol the connection negotiates.
///
/// RESP2 is the default.  RESP3 is requested with `HELLO 3` on connect and
/// unlocks typed replies (maps, sets, doubles, …) as well as server-initiated
/// push frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// RESP2 as supported by every server version.
    #[default]
    RESP2,
    /// RESP3, negotiated via `HELLO 3`.
    RESP3,
}

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The server generated an invalid response.
    ResponseError,
    /// The parser failed to parse the server response.
    ParseError,
    /// The authentication with the server failed.
    AuthenticationFailed,
    /// Operation failed because of a type mismatch.
    TypeError,
    /// A transaction was aborted (`EXEC` returned Nil after a `WATCH` fired,
    /// or the transaction body failed).
    ExecAbortError,
    /// The server cannot respond because it's loading a dump.
    BusyLoadingError,
    /// A script that was requested does not actually exist.
    NoScriptError,
    /// An error that was caused because the parameters given to the
    /// client were wrong.
    InvalidClientConfig,
    /// Raised if a key moved to a different node.
    Moved,
    /// Raised if a key moved to a different node but we need to ask.
    Ask,
    /// Raised if a request needs to be retried.
    TryAgain,
    /// Raised if a redis cluster is down.
    ClusterDown,
    /// A request spans multiple slots.
    CrossSlot,
    /// A cluster master is unavailable.
    MasterDown,
    /// Attempt to write to a read-only server.
    ReadOnly,
    /// This kind is returned if the redis error is one that is
    /// not native to the system.  This is usually the case if
    /// the cause is another error.
    IoError,
    /// An error raised that was identified on the client before execution.
    ClientError,
    /// The connection is in subscriber mode and the command is not in the
    /// pub/sub allowed set.  Raised locally, before anything hits the wire.
    SubscriptionMode,
    /// No node is known for the hash slot of the dispatched key.
    ClusterConnectionNotFound,
    /// An extension error.  This is an error created by the server
    /// that is not directly understood by the library.
    ExtensionError,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
#[doc(hidden)]
pub enum ServerErrorKind {
    ResponseError,
    ExecAbortError,
    BusyLoadingError,
    NoScriptError,
    Moved,
    Ask,
    TryAgain,
    ClusterDown,
    CrossSlot,
    MasterDown,
    ReadOnly,
}

/// An error line sent by the server, split into the leading code and the
/// free-form detail.  Kept inside [`Value`] so that errors nested in
/// transaction replies survive until the caller inspects each slot.
#[derive(PartialEq, Debug, Clone)]
pub enum ServerError {
    #[doc(hidden)]
    ExtensionError {
        /// The leading word of the error line, e.g. `WRONGTYPE`.
        code: String,
        /// Everything after the code.
        detail: Option<String>,
    },
    #[doc(hidden)]
    KnownError {
        #[doc(hidden)]
        kind: ServerErrorKind,
        /// Everything after the code.
        detail: Option<String>,
    },
}

impl ServerError {
    pub(crate) fn details(&self) -> Option<&str> {
        match self {
            ServerError::ExtensionError { detail, .. } => detail.as_deref(),
            ServerError::KnownError { detail, .. } => detail.as_deref(),
        }
    }
}

impl From<ServerError> for RedisError {
    fn from(value: ServerError) -> Self {
        match value {
            ServerError::ExtensionError { code, detail } => make_extension_error(code, detail),
            ServerError::KnownError { kind, detail } => {
                let desc = "An error was signalled by the server";
                let kind = match kind {
                    ServerErrorKind::ResponseError => ErrorKind::ResponseError,
                    ServerErrorKind::ExecAbortError => ErrorKind::ExecAbortError,
                    ServerErrorKind::BusyLoadingError => ErrorKind::BusyLoadingError,
                    ServerErrorKind::NoScriptError => ErrorKind::NoScriptError,
                    ServerErrorKind::Moved => ErrorKind::Moved,
                    ServerErrorKind::Ask => ErrorKind::Ask,
                    ServerErrorKind::TryAgain => ErrorKind::TryAgain,
                    ServerErrorKind::ClusterDown => ErrorKind::ClusterDown,
                    ServerErrorKind::CrossSlot => ErrorKind::CrossSlot,
                    ServerErrorKind::MasterDown => ErrorKind::MasterDown,
                    ServerErrorKind::ReadOnly => ErrorKind::ReadOnly,
                };
                match detail {
                    Some(detail) => RedisError::from((kind, desc, detail)),
                    None => RedisError::from((kind, desc)),
                }
            }
        }
    }
}

/// The kind of a RESP3 push frame, taken from its first element.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum PushKind {
    /// Client-side-cache invalidation.
    Invalidate,
    /// `message` from a channel subscription.
    Message,
    /// `pmessage` from a pattern subscription.
    PMessage,
    /// Ack for `SUBSCRIBE`.
    Subscribe,
    /// Ack for `PSUBSCRIBE`.
    PSubscribe,
    /// Ack for `UNSUBSCRIBE`.
    Unsubscribe,
    /// Ack for `PUNSUBSCRIBE`.
    PUnsubscribe,
    /// Synthesized locally when the connection's driver terminates.  Never
    /// received from the wire.
    Disconnection,
    /// Any other push kind.
    Other(String),
}

impl PushKind {
    /// Whether a push frame of this kind doubles as the reply to an in-flight
    /// request (the subscription acks do; out-of-band messages don't).
    pub(crate) fn has_reply(&self) -> bool {
        matches!(
            self,
            PushKind::Subscribe
                | PushKind::PSubscribe
                | PushKind::Unsubscribe
                | PushKind::PUnsubscribe
        )
    }
}

pub(crate) fn push_kind_from_str(kind: &str) -> PushKind {
    match kind {
        "invalidate" => PushKind::Invalidate,
        "message" => PushKind::Message,
        "pmessage" => PushKind::PMessage,
        "subscribe" => PushKind::Subscribe,
        "psubscribe" => PushKind::PSubscribe,
        "unsubscribe" => PushKind::Unsubscribe,
        "punsubscribe" => PushKind::PUnsubscribe,
        _ => PushKind::Other(kind.to_string()),
    }
}

/// Holds information about a received push frame.
#[derive(Debug, Clone)]
pub struct PushInfo {
    /// Push kind.
    pub kind: PushKind,
    /// The frame elements after the kind.
    pub data: Vec<Value>,
}

/// The format tag of a RESP3 verbatim string.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum VerbatimFormat {
    /// `txt`
    Text,
    /// `mkd`
    Markdown,
    /// Any other three-byte tag.
    Unknown(String),
}

/// A redis value, as decoded from the wire.
///
/// Binary-safe payloads stay `Vec<u8>`; only simple strings and error lines
/// are decoded as text, matching the server's contract.  In RESP2 mode only
/// the first six variants can occur; the remainder are RESP3 extensions.
#[derive(PartialEq, Clone)]
pub enum Value {
    /// A nil response from the server (`$-1`, or `_` in RESP3).
    Nil,
    /// A nil array response (`*-1`).  Distinct from a nil bulk string: a
    /// timed-out `BLPOP` returns this, and an aborted `EXEC` does too.
    NilArray,
    /// An integer response.  Note that there are a few situations
    /// in which redis actually returns a string for an integer.
    Int(i64),
    /// An arbitrary binary string.
    BulkString(Vec<u8>),
    /// A response containing other values.
    Array(Vec<Value>),
    /// A simple status response.
    SimpleString(String),
    /// The status response `OK`, split out because it is matched constantly.
    Okay,
    /// A RESP3 map of key/value pairs.
    Map(Vec<(Value, Value)>),
    /// A RESP3 set.  Order is whatever the server sent.
    Set(Vec<Value>),
    /// A RESP3 double.
    Double(f64),
    /// A RESP3 boolean.
    Boolean(bool),
    /// A RESP3 number too large for an `i64`.
    BigNumber(BigInt),
    /// A RESP3 string with a format tag.
    VerbatimString {
        /// The three-byte format tag.
        format: VerbatimFormat,
        /// The payload.
        text: String,
    },
    /// A RESP3 out-of-band push frame.
    Push {
        /// The push kind, from the frame's first element.
        kind: PushKind,
        /// The remaining elements.
        data: Vec<Value>,
    },
    /// An error line from the server.  Kept in-band so that errors inside
    /// array replies (e.g. `EXEC` results) reach the caller positionally;
    /// use [`Value::extract_error`] to lift it into a `RedisError`.
    ServerError(ServerError),
}

impl Value {
    /// Turns an in-band server error into `Err`, passing every other value
    /// through.
    pub fn extract_error(self) -> RedisResult<Value> {
        match self {
            Value::ServerError(err) => Err(err.into()),
            other => Ok(other),
        }
    }

    /// Returns an `&[Value]` if `self` is compatible with a sequence type.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(&items[..]),
            Value::Set(items) => Some(&items[..]),
            Value::Nil | Value::NilArray => Some(&[]),
            _ => None,
        }
    }

    /// Returns a `Vec<Value>` if `self` is compatible with a sequence type,
    /// otherwise returns `Err(self)`.
    pub fn into_sequence(self) -> Result<Vec<Value>, Value> {
        match self {
            Value::Array(items) => Ok(items),
            Value::Set(items) => Ok(items),
            Value::Nil | Value::NilArray => Ok(vec![]),
            _ => Err(self),
        }
    }

    /// Returns the bytes of a bulk or simple string reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(bytes) => Some(bytes),
            Value::SimpleString(s) => Some(s.as_bytes()),
            Value::VerbatimString { text, .. } => Some(text.as_bytes()),
            Value::Okay => Some(b"OK"),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(fmt, "nil"),
            Value::NilArray => write!(fmt, "nil-array"),
            Value::Int(val) => write!(fmt, "int({val:?})"),
            Value::BulkString(val) => match from_utf8(val) {
                Ok(x) => write!(fmt, "bulk-string('{x:?}')"),
                Err(_) => write!(fmt, "binary-data({val:?})"),
            },
            Value::Array(values) => write!(fmt, "array({values:?})"),
            Value::SimpleString(s) => write!(fmt, "simple-string({s:?})"),
            Value::Okay => write!(fmt, "ok"),
            Value::Map(values) => write!(fmt, "map({values:?})"),
            Value::Set(values) => write!(fmt, "set({values:?})"),
            Value::Double(val) => write!(fmt, "double({val:?})"),
            Value::Boolean(val) => write!(fmt, "boolean({val:?})"),
            Value::BigNumber(val) => write!(fmt, "big-number({val:?})"),
            Value::VerbatimString { format, text } => {
                write!(fmt, "verbatim-string({format:?}, {text:?})")
            }
            Value::Push { kind, data } => write!(fmt, "push({kind:?}, {data:?})"),
            Value::ServerError(err) => write!(fmt, "server-error({err:?})"),
        }
    }
}

/// Represents a pubsub message.
#[derive(Debug, Clone)]
pub struct Msg {
    payload: Value,
    channel: Value,
    pattern: Option<Value>,
}

impl Msg {
    /// Builds a `Msg` from a RESP2 `message`/`pmessage` array or a RESP3
    /// push frame.  Returns `None` for anything else.
    pub fn from_owned_value(value: Value) -> Option<Self> {
        if let Value::Push { kind, data } = value {
            return Self::from_push_info(PushInfo { kind, data });
        }
        let mut iter = value.into_sequence().ok()?.into_iter();
        let kind: Vec<u8> = iter.next()?.as_bytes()?.to_vec();
        let mut pattern = None;
        let channel;
        if kind == b"message" {
            channel = iter.next()?;
        } else if kind == b"pmessage" {
            pattern = Some(iter.next()?);
            channel = iter.next()?;
        } else {
            return None;
        }
        let payload = iter.next()?;
        Some(Msg {
            payload,
            channel,
            pattern,
        })
    }

    /// Builds a `Msg` from the data of a push frame.
    pub fn from_push_info(push_info: PushInfo) -> Option<Self> {
        let mut iter = push_info.data.into_iter();
        let mut pattern = None;
        let channel;
        match push_info.kind {
            PushKind::Message => channel = iter.next()?,
            PushKind::PMessage => {
                pattern = Some(iter.next()?);
                channel = iter.next()?;
            }
            _ => return None,
        }
        let payload = iter.next()?;
        Some(Msg {
            payload,
            channel,
            pattern,
        })
    }

    /// The channel the message was sent to, as a lossless byte slice.
    pub fn get_channel_bytes(&self) -> &[u8] {
        self.channel.as_bytes().unwrap_or_default()
    }

    /// The channel name, decoded as UTF-8.
    pub fn get_channel_name(&self) -> &str {
        from_utf8(self.get_channel_bytes()).unwrap_or_default()
    }

    /// The message payload, converted to the requested type.
    pub fn get_payload<T: FromRedisValue>(&self) -> RedisResult<T> {
        from_redis_value(self.payload.clone())
    }

    /// The raw payload bytes.
    pub fn get_payload_bytes(&self) -> &[u8] {
        self.payload.as_bytes().unwrap_or_default()
    }

    /// The raw pattern bytes, for pattern subscriptions.
    pub fn get_pattern_bytes(&self) -> Option<&[u8]> {
        self.pattern.as_ref().and_then(Value::as_bytes)
    }

    /// The pattern that matched, for pattern subscriptions.
    pub fn get_pattern<T: FromRedisValue>(&self) -> RedisResult<T> {
        match &self.pattern {
            None => from_redis_value(Value::Nil),
            Some(pattern) => from_redis_value(pattern.clone()),
        }
    }

    /// True if this message was received through a pattern subscription.
    pub fn from_pattern(&self) -> bool {
        self.pattern.is_some()
    }
}

/// Represents a redis error.
pub struct RedisError {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    ExtensionError(String, String),
    IoError(io::Error),
}

impl PartialEq for RedisError {
    fn eq(&self, other: &RedisError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::ExtensionError(a, _), ErrorRepr::ExtensionError(b, _)) => *a == *b,
            _ => false,
        }
    }
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<Utf8Error> for RedisError {
    fn from(_: Utf8Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(ErrorKind::TypeError, "Invalid UTF-8"),
        }
    }
}

impl From<FromUtf8Error> for RedisError {
    fn from(_: FromUtf8Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(ErrorKind::TypeError, "Cannot convert from UTF-8"),
        }
    }
}

impl From<(ErrorKind, &'static str)> for RedisError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RedisError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl error::Error for RedisError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.repr {
            ErrorRepr::IoError(ref err) => Some(err as &dyn error::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::ExtensionError(ref code, ref detail) => {
                code.fmt(f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::IoError(ref err) => err.fmt(f),
        }
    }
}

impl fmt::Debug for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl RedisError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::ExtensionError(_, _) => ErrorKind::ExtensionError,
            ErrorRepr::IoError(_) => ErrorKind::IoError,
        }
    }

    /// Returns the error detail, the part of a server error line after the
    /// leading code.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail)
            | ErrorRepr::ExtensionError(_, ref detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    /// Returns the raw error code if available.
    pub fn code(&self) -> Option<&str> {
        match self.kind() {
            ErrorKind::ResponseError => Some("ERR"),
            ErrorKind::ExecAbortError => Some("EXECABORT"),
            ErrorKind::BusyLoadingError => Some("LOADING"),
            ErrorKind::NoScriptError => Some("NOSCRIPT"),
            ErrorKind::Moved => Some("MOVED"),
            ErrorKind::Ask => Some("ASK"),
            ErrorKind::TryAgain => Some("TRYAGAIN"),
            ErrorKind::ClusterDown => Some("CLUSTERDOWN"),
            ErrorKind::CrossSlot => Some("CROSSSLOT"),
            ErrorKind::MasterDown => Some("MASTERDOWN"),
            ErrorKind::ReadOnly => Some("READONLY"),
            _ => match self.repr {
                ErrorRepr::ExtensionError(ref code, _) => Some(code),
                _ => None,
            },
        }
    }

    /// Returns the name of the error category for display purposes.
    pub fn category(&self) -> &str {
        match self.kind() {
            ErrorKind::ResponseError => "response error",
            ErrorKind::ParseError => "parse error",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::TypeError => "type error",
            ErrorKind::ExecAbortError => "transaction aborted",
            ErrorKind::BusyLoadingError => "busy loading",
            ErrorKind::NoScriptError => "no script",
            ErrorKind::InvalidClientConfig => "invalid client config",
            ErrorKind::Moved => "key moved",
            ErrorKind::Ask => "key moved (ask)",
            ErrorKind::TryAgain => "try again",
            ErrorKind::ClusterDown => "cluster down",
            ErrorKind::CrossSlot => "cross-slot",
            ErrorKind::MasterDown => "master down",
            ErrorKind::ReadOnly => "read-only",
            ErrorKind::IoError => "I/O error",
            ErrorKind::ClientError => "client error",
            ErrorKind::SubscriptionMode => "subscriber mode",
            ErrorKind::ClusterConnectionNotFound => "no node for slot",
            ErrorKind::ExtensionError => "extension error",
        }
    }

    /// Indicates that this failure is an IO failure.
    pub fn is_io_error(&self) -> bool {
        self.kind() == ErrorKind::IoError
    }

    /// Indicates that this is a cluster redirect or retry error.
    pub fn is_cluster_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Moved | ErrorKind::Ask | ErrorKind::TryAgain | ErrorKind::ClusterDown
        )
    }

    /// True when the connection this error came from must not be reused.
    pub(crate) fn is_unrecoverable_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::IoError | ErrorKind::ParseError)
    }

    /// For `MOVED`/`ASK` errors, parses `<slot> <host>:<port>` out of the
    /// error detail.
    pub fn redirect_node(&self) -> Option<(&str, u16)> {
        match self.kind() {
            ErrorKind::Ask | ErrorKind::Moved => (),
            _ => return None,
        }
        let mut iter = self.detail()?.split_ascii_whitespace();
        let _slot = iter.next()?;
        let node = iter.next()?;
        let (host, port) = node.rsplit_once(':')?;
        Some((host, port.parse().ok()?))
    }
}

pub(crate) fn make_extension_error(code: String, detail: Option<String>) -> RedisError {
    RedisError {
        repr: ErrorRepr::ExtensionError(
            code,
            match detail {
                Some(x) => x,
                None => "Unknown extension error encountered".to_string(),
            },
        ),
    }
}

pub(crate) fn closed_connection_error() -> RedisError {
    RedisError::from(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "Connection closed",
    ))
}

/// Library generic result type.
pub type RedisResult<T> = Result<T, RedisError>;

/// Library generic future type.
pub type RedisFuture<'a, T> = futures_util::future::BoxFuture<'a, RedisResult<T>>;

/// An abstraction over a sequence of bytes that acts as an argument sink for
/// commands.
pub trait RedisWrite {
    /// Accepts a serialized redis command argument.
    fn write_arg(&mut self, arg: &[u8]);

    /// Accepts a displayable argument, formatting it in place.
    fn write_arg_fmt(&mut self, arg: impl fmt::Display) {
        self.write_arg(arg.to_string().as_bytes())
    }
}

impl RedisWrite for Vec<Vec<u8>> {
    fn write_arg(&mut self, arg: &[u8]) {
        self.push(arg.to_owned());
    }
}

/// Used to convert a value into one or multiple redis argument
/// strings.  Most values will produce exactly one item.
pub trait ToRedisArgs: Sized {
    /// Writes the value into `out` as one or more arguments.
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite;

    /// Converts the value into a vector of serialized arguments.
    fn to_redis_args(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.write_redis_args(&mut out);
        out
    }

    /// Writes a slice of this type as arguments.  The default writes each
    /// element on its own; bytes override this so that `&[u8]` stays one
    /// binary-safe argument instead of a run of numbers.
    #[doc(hidden)]
    fn write_args_from_slice<W>(items: &[Self], out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        for item in items {
            item.write_redis_args(out);
        }
    }
}

macro_rules! itoa_based_to_redis_impl {
    ($t:ty) => {
        impl ToRedisArgs for $t {
            fn write_redis_args<W>(&self, out: &mut W)
            where
                W: ?Sized + RedisWrite,
            {
                let mut buf = ::itoa::Buffer::new();
                out.write_arg(buf.format(*self).as_bytes())
            }
        }
    };
}

itoa_based_to_redis_impl!(i8);
itoa_based_to_redis_impl!(i16);
itoa_based_to_redis_impl!(i32);
itoa_based_to_redis_impl!(i64);
itoa_based_to_redis_impl!(u16);
itoa_based_to_redis_impl!(u32);
itoa_based_to_redis_impl!(u64);
itoa_based_to_redis_impl!(usize);
itoa_based_to_redis_impl!(isize);

impl ToRedisArgs for u8 {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        let mut buf = ::itoa::Buffer::new();
        out.write_arg(buf.format(*self).as_bytes())
    }

    // A slice of bytes is one binary argument, not a run of numbers.
    fn write_args_from_slice<W>(items: &[u8], out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(items)
    }
}

macro_rules! ryu_based_to_redis_impl {
    ($t:ty) => {
        impl ToRedisArgs for $t {
            fn write_redis_args<W>(&self, out: &mut W)
            where
                W: ?Sized + RedisWrite,
            {
                let mut buf = ::ryu::Buffer::new();
                out.write_arg(buf.format(*self).as_bytes())
            }
        }
    };
}

ryu_based_to_redis_impl!(f32);
ryu_based_to_redis_impl!(f64);

impl ToRedisArgs for bool {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(if *self { b"1" } else { b"0" })
    }
}

impl ToRedisArgs for String {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self.as_bytes())
    }
}

impl ToRedisArgs for &str {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg(self.as_bytes())
    }
}

impl<T: ToRedisArgs> ToRedisArgs for Vec<T> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        T::write_args_from_slice(self, out)
    }
}

impl<T: ToRedisArgs> ToRedisArgs for &[T] {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        T::write_args_from_slice(self, out)
    }
}

impl<T: ToRedisArgs, const N: usize> ToRedisArgs for [T; N] {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        T::write_args_from_slice(self, out)
    }
}

impl<T: ToRedisArgs> ToRedisArgs for &T {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        (*self).write_redis_args(out)
    }
}

impl<T: ToRedisArgs> ToRedisArgs for Option<T> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        if let Some(ref x) = *self {
            x.write_redis_args(out);
        }
    }
}

/// Used to convert a redis value into a more appropriate type.
///
/// The conversions are deliberately forgiving about the concrete wire type,
/// because the server mixes integers and strings for numeric responses.
pub trait FromRedisValue: Sized {
    /// Converts an owned value into the target type, or fails with a
    /// `TypeError`.
    fn from_redis_value(v: Value) -> RedisResult<Self>;
}

/// Shortcut function for converting a value into another type.
pub fn from_redis_value<T: FromRedisValue>(v: Value) -> RedisResult<T> {
    T::from_redis_value(v)
}

impl FromRedisValue for Value {
    fn from_redis_value(v: Value) -> RedisResult<Value> {
        Ok(v)
    }
}

impl FromRedisValue for () {
    fn from_redis_value(_v: Value) -> RedisResult<()> {
        Ok(())
    }
}

macro_rules! from_redis_value_for_num {
    ($t:ty) => {
        impl FromRedisValue for $t {
            fn from_redis_value(v: Value) -> RedisResult<$t> {
                match v {
                    Value::Int(val) => match <$t>::try_from(val) {
                        Ok(val) => Ok(val),
                        Err(_) => invalid_type_error!(Value::Int(val), "Integer out of range"),
                    },
                    Value::BulkString(ref bytes) => match from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse::<$t>().ok())
                    {
                        Some(val) => Ok(val),
                        None => invalid_type_error!(v, "Could not convert from string"),
                    },
                    Value::SimpleString(ref s) => match s.parse::<$t>() {
                        Ok(val) => Ok(val),
                        Err(_) => invalid_type_error!(v, "Could not convert from string"),
                    },
                    _ => invalid_type_error!(v, "Response type not convertible to numeric"),
                }
            }
        }
    };
}

from_redis_value_for_num!(i32);
from_redis_value_for_num!(i64);
from_redis_value_for_num!(u32);
from_redis_value_for_num!(u64);
from_redis_value_for_num!(usize);
from_redis_value_for_num!(isize);

impl FromRedisValue for f64 {
    fn from_redis_value(v: Value) -> RedisResult<f64> {
        match v {
            Value::Int(val) => Ok(val as f64),
            Value::Double(val) => Ok(val),
            Value::BulkString(ref bytes) => {
                match from_utf8(bytes).ok().and_then(|s| s.parse::<f64>().ok()) {
                    Some(val) => Ok(val),
                    None => invalid_type_error!(v, "Could not convert from string"),
                }
            }
            _ => invalid_type_error!(v, "Response type not convertible to double"),
        }
    }
}

impl FromRedisValue for bool {
    fn from_redis_value(v: Value) -> RedisResult<bool> {
        match v {
            Value::Nil | Value::NilArray => Ok(false),
            Value::Int(val) => Ok(val != 0),
            Value::Boolean(b) => Ok(b),
            Value::Okay => Ok(true),
            Value::SimpleString(ref s) => Ok(!s.is_empty()),
            Value::BulkString(ref bytes) => match bytes.as_slice() {
                b"0" => Ok(false),
                b"1" => Ok(true),
                _ => invalid_type_error!(v, "Response type not bool compatible"),
            },
            _ => invalid_type_error!(v, "Response type not bool compatible"),
        }
    }
}

impl FromRedisValue for String {
    fn from_redis_value(v: Value) -> RedisResult<String> {
        match v {
            Value::BulkString(bytes) => Ok(String::from_utf8(bytes)?),
            Value::SimpleString(s) => Ok(s),
            Value::VerbatimString { text, .. } => Ok(text),
            Value::Okay => Ok("OK".to_string()),
            Value::Int(val) => Ok(val.to_string()),
            Value::Double(val) => Ok(val.to_string()),
            _ => invalid_type_error!(v, "Response type not string compatible"),
        }
    }
}

impl<T: FromRedisValue> FromRedisValue for Vec<T> {
    fn from_redis_value(v: Value) -> RedisResult<Vec<T>> {
        let items = match v.into_sequence() {
            Ok(items) => items,
            Err(v) => invalid_type_error!(v, "Response type not vector compatible"),
        };
        items.into_iter().map(from_redis_value).collect()
    }
}

impl<T: FromRedisValue> FromRedisValue for Option<T> {
    fn from_redis_value(v: Value) -> RedisResult<Option<T>> {
        match v {
            Value::Nil | Value::NilArray => Ok(None),
            v => Ok(Some(from_redis_value(v)?)),
        }
    }
}

impl<A: FromRedisValue, B: FromRedisValue> FromRedisValue for (A, B) {
    fn from_redis_value(v: Value) -> RedisResult<(A, B)> {
        let items = match v.into_sequence() {
            Ok(items) if items.len() == 2 => items,
            Ok(items) => invalid_type_error!(
                Value::Array(items),
                "Expected a response of exactly two elements"
            ),
            Err(v) => invalid_type_error!(v, "Response type not tuple compatible"),
        };
        let mut iter = items.into_iter();
        Ok((
            from_redis_value(iter.next().unwrap())?,
            from_redis_value(iter.next().unwrap())?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_node_parses_moved_detail() {
        let err = RedisError::from(ServerError::KnownError {
            kind: ServerErrorKind::Moved,
            detail: Some("1234 127.0.0.1:6380".to_string()),
        });
        assert_eq!(err.kind(), ErrorKind::Moved);
        assert_eq!(err.redirect_node(), Some(("127.0.0.1", 6380)));
    }

    #[test]
    fn redirect_node_ignores_other_kinds() {
        let err = RedisError::from((
            ErrorKind::ResponseError,
            "An error was signalled by the server",
            "1234 127.0.0.1:6380".to_string(),
        ));
        assert_eq!(err.redirect_node(), None);
    }

    #[test]
    fn extension_errors_keep_their_code() {
        let err = make_extension_error("WRONGTYPE".to_string(), Some("nope".to_string()));
        assert_eq!(err.code(), Some("WRONGTYPE"));
        assert_eq!(err.detail(), Some("nope"));
    }

    #[test]
    fn numeric_conversions_accept_strings() {
        assert_eq!(
            from_redis_value::<i64>(Value::BulkString(b"42".to_vec())).unwrap(),
            42
        );
        assert_eq!(from_redis_value::<i64>(Value::Int(42)).unwrap(), 42);
        assert!(from_redis_value::<u32>(Value::Int(-1)).is_err());
    }

    #[test]
    fn msg_from_resp2_array() {
        let msg = Msg::from_owned_value(Value::Array(vec![
            Value::BulkString(b"message".to_vec()),
            Value::BulkString(b"chan".to_vec()),
            Value::BulkString(b"payload".to_vec()),
        ]))
        .unwrap();
        assert_eq!(msg.get_channel_name(), "chan");
        assert_eq!(msg.get_payload_bytes(), b"payload");
        assert!(!msg.from_pattern());
    }

    #[test]
    fn msg_from_push_frame() {
        let msg = Msg::from_push_info(PushInfo {
            kind: PushKind::PMessage,
            data: vec![
                Value::BulkString(b"ch*".to_vec()),
                Value::BulkString(b"chan".to_vec()),
                Value::BulkString(b"payload".to_vec()),
            ],
        })
        .unwrap();
        assert!(msg.from_pattern());
        assert_eq!(msg.get_pattern::<String>().unwrap(), "ch*");
    }
}
