use crate::cmd::{cmd, Cmd};
use crate::types::{from_redis_value, ErrorKind, FromRedisValue, RedisResult, Value};

/// Represents a redis command pipeline.
///
/// A pipeline allows you to send multiple commands in one go to the
/// redis server.  API wise it's very similar to just using a command
/// but it allows multiple commands to be chained.
///
/// ```rust,no_run
/// # async fn do_something(con: &mut redmux::aio::MultiplexedConnection) -> redmux::RedisResult<()> {
/// let (k1, k2): (i32, i32) = redmux::pipe()
///     .cmd("SET").arg("key_1").arg(42)
///     .cmd("SET").arg("key_2").arg(43)
///     .cmd("GET").arg("key_1")
///     .cmd("GET").arg("key_2")
///     .query_async(con).await?;
/// # Ok(()) }
/// ```
#[derive(Clone, Default)]
pub struct Pipeline {
    commands: Vec<Cmd>,
    transaction_mode: bool,
}

impl Pipeline {
    /// Creates an empty pipeline.  For consistency with the `cmd`
    /// api a `pipe` function is provided as alias.
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    /// Starts a new command in the pipeline.  Returns the command so
    /// arguments can be chained onto it.
    #[inline]
    pub fn cmd(&mut self, name: &str) -> &mut Pipeline {
        self.add_command(cmd(name))
    }

    /// Adds an already assembled command to the pipeline.
    #[inline]
    pub fn add_command(&mut self, cmd: Cmd) -> &mut Pipeline {
        self.commands.push(cmd);
        self
    }

    /// Appends an argument to the most recently started command.
    #[inline]
    pub fn arg<T: crate::ToRedisArgs>(&mut self, arg: T) -> &mut Pipeline {
        self.commands
            .last_mut()
            .expect("pipeline has no command to add an argument to")
            .arg(arg);
        self
    }

    /// Enables atomic mode.  In atomic mode the whole pipeline is
    /// enclosed in `MULTI`/`EXEC`: the commands are queued on the server
    /// and executed as one transaction, and the `EXEC` reply array is
    /// split back into per-command results.  From the caller's point of
    /// view nothing else changes.
    #[inline]
    pub fn atomic(&mut self) -> &mut Pipeline {
        self.transaction_mode = true;
        self
    }

    /// Returns `true` if the pipeline is in transaction (atomic) mode.
    pub fn is_transaction(&self) -> bool {
        self.transaction_mode
    }

    /// Returns the number of commands queued by the user in the pipeline.
    ///
    /// In atomic mode the wire carries two more (`MULTI` and `EXEC`).
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` if the pipeline contains no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Iterates over the queued commands.
    pub fn cmd_iter(&self) -> impl Iterator<Item = &Cmd> {
        self.commands.iter()
    }

    /// Returns the packed wire form of the whole pipeline.
    pub fn get_packed_pipeline(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.transaction_mode {
            cmd("MULTI").write_packed_command(&mut out);
        }
        for command in &self.commands {
            command.write_packed_command(&mut out);
        }
        if self.transaction_mode {
            cmd("EXEC").write_packed_command(&mut out);
        }
        out
    }

    /// How many leading responses carry no payload for the caller
    /// (`+OK` for `MULTI` and one `+QUEUED` per command), and how many
    /// carry results.
    pub(crate) fn response_counts(&self) -> (usize, usize) {
        if self.transaction_mode {
            (self.commands.len() + 1, 1)
        } else {
            (0, self.commands.len())
        }
    }

    /// Executes the pipeline and fetches the return values.  Since most
    /// pipelines return different types it's recommended to use tuple
    /// matching to process the results.
    #[inline]
    pub async fn query_async<T: FromRedisValue>(
        &self,
        con: &mut impl crate::aio::ConnectionLike,
    ) -> RedisResult<T> {
        let (skip, count) = self.response_counts();
        let response = con.req_packed_commands(self, skip, count).await?;
        self.complete_request(response)
    }

    /// This is an alternative to [Self::query_async] for callers that don't
    /// care about the pipeline's response values.
    pub async fn exec_async(&self, con: &mut impl crate::aio::ConnectionLike) -> RedisResult<()> {
        self.query_async::<()>(con).await
    }

    fn complete_request<T: FromRedisValue>(&self, mut response: Vec<Value>) -> RedisResult<T> {
        let response = if self.transaction_mode {
            match response.pop() {
                // EXEC answers Nil when a WATCH fired; every queued command
                // is aborted with it.
                Some(Value::Nil) | Some(Value::NilArray) => {
                    fail!((
                        ErrorKind::ExecAbortError,
                        "Transaction aborted by the server"
                    ))
                }
                Some(Value::ServerError(err)) => return Err(err.into()),
                Some(Value::Array(items)) => items,
                _ => {
                    fail!((
                        ErrorKind::ResponseError,
                        "Invalid response when parsing the transaction result"
                    ))
                }
            }
        } else {
            response
        };

        // The first error in any slot fails the whole request.
        let response = response
            .into_iter()
            .map(Value::extract_error)
            .collect::<RedisResult<Vec<Value>>>()?;

        from_redis_value(Value::Array(response))
    }
}

/// Shortcut for creating a new pipeline.
pub fn pipe() -> Pipeline {
    Pipeline::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_pipeline_concatenates_commands() {
        let mut p = pipe();
        p.cmd("SET").arg("k").arg("v").cmd("GET").arg("k");
        assert_eq!(
            p.get_packed_pipeline(),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec()
        );
        assert_eq!(p.response_counts(), (0, 2));
    }

    #[test]
    fn atomic_mode_wraps_in_multi_exec() {
        let mut p = pipe();
        p.atomic().cmd("INCR").arg("k");
        let packed = p.get_packed_pipeline();
        assert!(packed.starts_with(b"*1\r\n$5\r\nMULTI\r\n"));
        assert!(packed.ends_with(b"*1\r\n$4\r\nEXEC\r\n"));
        // One MULTI ack, one QUEUED, then the EXEC array.
        assert_eq!(p.response_counts(), (2, 1));
    }

    #[test]
    fn aborted_transaction_fails_every_slot() {
        let mut p = pipe();
        p.atomic().cmd("INCR").arg("k");
        let err = p
            .complete_request::<Vec<Value>>(vec![Value::NilArray])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecAbortError);
    }

    #[test]
    fn transaction_reply_is_split_positionally() {
        let mut p = pipe();
        p.atomic().cmd("INCR").arg("k").cmd("INCR").arg("k");
        let (one, two): (i64, i64) = p
            .complete_request(vec![Value::Array(vec![Value::Int(1), Value::Int(2)])])
            .unwrap();
        assert_eq!((one, two), (1, 2));
    }
}
