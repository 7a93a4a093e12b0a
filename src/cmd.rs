use std::fmt;

use crate::types::{from_redis_value, FromRedisValue, RedisResult, RedisWrite, ToRedisArgs};

/// A command acts as a builder interface to creating encoded redis
/// requests.  This allows you to easily assemble a packed command
/// by chaining arguments together.
///
/// Basic example:
///
/// ```rust
/// redmux::Cmd::new().arg("SET").arg("my_key").arg(42);
/// ```
///
/// There is also a helper function called `cmd` which makes it a
/// tiny bit shorter:
///
/// ```rust
/// redmux::cmd("SET").arg("my_key").arg(42);
/// ```
#[derive(Clone, Default)]
pub struct Cmd {
    data: Vec<u8>,
    // Each entry marks the end offset of one argument inside `data`.
    args: Vec<usize>,
}

impl RedisWrite for Cmd {
    fn write_arg(&mut self, arg: &[u8]) {
        self.data.extend_from_slice(arg);
        self.args.push(self.data.len());
    }

    fn write_arg_fmt(&mut self, arg: impl fmt::Display) {
        use std::io::Write;
        write!(self.data, "{arg}").unwrap();
        self.args.push(self.data.len());
    }
}

impl Cmd {
    /// Creates a new empty command.
    pub fn new() -> Cmd {
        Cmd::default()
    }

    /// Creates a new empty command with at least the requested capacities.
    pub fn with_capacity(arg_count: usize, size_of_data: usize) -> Cmd {
        Cmd {
            data: Vec::with_capacity(size_of_data),
            args: Vec::with_capacity(arg_count),
        }
    }

    /// Appends an argument to the command.  The argument passed must
    /// be a type that implements `ToRedisArgs`.  Most primitive types as
    /// well as slices of them implement it.
    ///
    /// ```rust
    /// redmux::cmd("SET").arg(&["my_key", "my_value"]);
    /// redmux::cmd("SET").arg("my_key").arg(42);
    /// redmux::cmd("SET").arg("my_key").arg(b"my_value");
    /// ```
    #[inline]
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut Cmd {
        arg.write_redis_args(self);
        self
    }

    /// Returns the number of arguments in this command, the command
    /// keyword included.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Returns the packed wire form of the command, as an array of bulk
    /// strings.  The inline text form is never produced.
    #[inline]
    pub fn get_packed_command(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed_command_len());
        self.write_packed_command(&mut out);
        out
    }

    pub(crate) fn packed_command_len(&self) -> usize {
        // marker + decimal count + CRLF, then per argument the bulk header
        // and trailer around the payload.
        let mut total = 1 + decimal_len(self.args.len()) + 2;
        for arg in self.args_iter() {
            total += 1 + decimal_len(arg.len()) + 2 + arg.len() + 2;
        }
        total
    }

    pub(crate) fn write_packed_command(&self, out: &mut Vec<u8>) {
        let mut buf = itoa::Buffer::new();
        out.push(b'*');
        out.extend_from_slice(buf.format(self.args.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        for arg in self.args_iter() {
            out.push(b'$');
            out.extend_from_slice(buf.format(arg.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
    }

    /// Returns an iterator over the arguments in this command, the command
    /// keyword included.
    pub fn args_iter(&self) -> impl ExactSizeIterator<Item = &[u8]> + Clone {
        let mut prev = 0;
        self.args.iter().map(move |&end| {
            let arg = &self.data[prev..end];
            prev = end;
            arg
        })
    }

    /// Returns a reference to the argument at `idx`, if present.
    pub(crate) fn arg_idx(&self, idx: usize) -> Option<&[u8]> {
        if idx >= self.args.len() {
            return None;
        }
        let start = if idx == 0 { 0 } else { self.args[idx - 1] };
        Some(&self.data[start..self.args[idx]])
    }

    /// Returns the index of the first argument equal to `candidate`,
    /// compared case-insensitively.
    pub(crate) fn position(&self, candidate: &[u8]) -> Option<usize> {
        self.args_iter()
            .position(|arg| arg.eq_ignore_ascii_case(candidate))
    }

    /// Sends the command to the connection and converts the result to the
    /// target type.  In-band server errors are lifted into `Err` here.
    #[inline]
    pub async fn query_async<T: FromRedisValue>(
        &self,
        con: &mut impl crate::aio::ConnectionLike,
    ) -> RedisResult<T> {
        let val = con.req_packed_command(self).await?;
        from_redis_value(val.extract_error()?)
    }

    /// This is an alternative to `query_async` that can be used if you want
    /// to be able to handle a command's success or failure but don't care
    /// about the command's response.  It avoids the need to name generic
    /// bounds for `()`.
    pub async fn exec_async(&self, con: &mut impl crate::aio::ConnectionLike) -> RedisResult<()> {
        self.query_async::<()>(con).await
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for arg in self.args_iter() {
            match std::str::from_utf8(arg) {
                Ok(s) => list.entry(&s),
                Err(_) => list.entry(&arg),
            };
        }
        list.finish()
    }
}

fn decimal_len(mut v: usize) -> usize {
    let mut len = 1;
    while v >= 10 {
        v /= 10;
        len += 1;
    }
    len
}

/// Shortcut function for creating a command with a single argument.
///
/// The first argument of a redis command is always the name of the command
/// which needs to be a string.  This is the recommended way to start a
/// command chain.
///
/// ```rust
/// redmux::cmd("PING");
/// ```
pub fn cmd(name: &str) -> Cmd {
    let mut rv = Cmd::new();
    rv.arg(name);
    rv
}

/// Packs a sequence of pre-serialized arguments into the wire form.
///
/// ```rust
/// # use redmux::ToRedisArgs;
/// let mut args = vec![];
/// args.extend("SET".to_redis_args());
/// args.extend("my_key".to_redis_args());
/// args.extend(42.to_redis_args());
/// let cmd = redmux::pack_command(&args);
/// assert_eq!(cmd, b"*3\r\n$3\r\nSET\r\n$6\r\nmy_key\r\n$2\r\n42\r\n".to_vec());
/// ```
pub fn pack_command(args: &[Vec<u8>]) -> Vec<u8> {
    let mut packed = Cmd::with_capacity(args.len(), args.iter().map(|a| a.len()).sum());
    for arg in args {
        packed.arg(arg.as_slice());
    }
    packed.get_packed_command()
}
