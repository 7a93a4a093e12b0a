use std::str;

use crate::types::{
    push_kind_from_str, ErrorKind, PushKind, RedisError, RedisResult, ServerError,
    ServerErrorKind, Value, VerbatimFormat,
};

use bytes::{Buf, BytesMut};
use combine::{
    any,
    error::StreamError,
    opaque,
    parser::{
        byte::{crlf, take_until_bytes},
        combinator::{any_send_sync_partial_state, AnySendSyncPartialState},
        range::{recognize, take},
    },
    stream::{RangeStream, StreamErrorFor},
    Parser as _,
};
use num_bigint::BigInt;
use tokio_util::codec::{Decoder, Encoder};

const MAX_RECURSE_DEPTH: usize = 100;

// Redis refuses bulk payloads above 512 MiB; a length line claiming more is
// garbage and must not reach the allocator.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

fn err_parser(line: &str) -> ServerError {
    let mut pieces = line.splitn(2, ' ');
    let kind = match pieces.next().unwrap() {
        "ERR" => ServerErrorKind::ResponseError,
        "EXECABORT" => ServerErrorKind::ExecAbortError,
        "LOADING" => ServerErrorKind::BusyLoadingError,
        "NOSCRIPT" => ServerErrorKind::NoScriptError,
        "MOVED" => ServerErrorKind::Moved,
        "ASK" => ServerErrorKind::Ask,
        "TRYAGAIN" => ServerErrorKind::TryAgain,
        "CLUSTERDOWN" => ServerErrorKind::ClusterDown,
        "CROSSSLOT" => ServerErrorKind::CrossSlot,
        "MASTERDOWN" => ServerErrorKind::MasterDown,
        "READONLY" => ServerErrorKind::ReadOnly,
        code => {
            return ServerError::ExtensionError {
                code: code.to_string(),
                detail: pieces.next().map(|detail| detail.to_string()),
            }
        }
    };
    let detail = pieces.next().map(|detail| detail.to_string());
    ServerError::KnownError { kind, detail }
}

fn value<'a, I>(
    depth: Option<usize>,
) -> impl combine::Parser<I, Output = Value, PartialState = AnySendSyncPartialState>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: combine::ParseError<u8, &'a [u8], I::Position>,
{
    let depth = depth.unwrap_or(1);

    opaque!(any_send_sync_partial_state(
        any()
            .then_partial(move |&mut b| {
                if (b == b'*' || b == b'%' || b == b'~' || b == b'>' || b == b'|')
                    && depth > MAX_RECURSE_DEPTH
                {
                    combine::unexpected_any("Maximum recursion depth exceeded").left()
                } else {
                    combine::value(b).right()
                }
            })
            .then_partial(move |&mut b| {
                let line = || {
                    recognize(take_until_bytes(&b"\r\n"[..]).with(take(2).map(|_| ()))).and_then(
                        |line: &[u8]| {
                            str::from_utf8(&line[..line.len() - 2])
                                .map_err(StreamErrorFor::<I>::other)
                        },
                    )
                };

                let simple_string = || {
                    line().map(|line| {
                        if line == "OK" {
                            Value::Okay
                        } else {
                            Value::SimpleString(line.into())
                        }
                    })
                };

                let int = || {
                    line().and_then(|line| {
                        line.trim().parse::<i64>().map_err(|_| {
                            StreamErrorFor::<I>::message_static_message(
                                "Expected integer, got garbage",
                            )
                        })
                    })
                };

                let bulk_string = || {
                    int().then_partial(move |size| {
                        if *size < 0 {
                            combine::produce(|| Value::Nil).left()
                        } else if *size as usize > MAX_BULK_LEN {
                            combine::unexpected_any("Bulk string length exceeds maximum")
                                .left()
                                .right()
                        } else {
                            take(*size as usize)
                                .map(|bs: &[u8]| Value::BulkString(bs.to_vec()))
                                .skip(crlf())
                                .right()
                                .right()
                        }
                    })
                };

                // A sized text payload, shared by verbatim strings and blob
                // errors.
                let blob = || {
                    int().then_partial(move |size| {
                        if *size < 0 || *size as usize > MAX_BULK_LEN {
                            combine::unexpected_any("Blob length out of range").left()
                        } else {
                            take(*size as usize)
                                .map(|bs: &[u8]| String::from_utf8_lossy(bs).to_string())
                                .skip(crlf())
                                .right()
                        }
                    })
                };

                let array = || {
                    int().then_partial(move |&mut length| {
                        if length < 0 {
                            combine::produce(|| Value::NilArray).left()
                        } else {
                            let length = length as usize;
                            combine::count_min_max(length, length, value(Some(depth + 1)))
                                .map(Value::Array)
                                .right()
                        }
                    })
                };

                let error = || line().map(err_parser);

                let map = || {
                    int().then_partial(move |&mut kv_length| {
                        let length = kv_length.max(0) as usize * 2;
                        combine::count_min_max(length, length, value(Some(depth + 1))).map(
                            move |result: Vec<Value>| {
                                let mut it = result.into_iter();
                                let mut pairs = Vec::with_capacity(kv_length.max(0) as usize);
                                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                                    pairs.push((k, v));
                                }
                                Value::Map(pairs)
                            },
                        )
                    })
                };

                // Attributes prefix the value they annotate; the annotation
                // itself is not surfaced.
                let attribute = || {
                    int().then_partial(move |&mut kv_length| {
                        let length = kv_length.max(0) as usize * 2 + 1;
                        combine::count_min_max(length, length, value(Some(depth + 1))).map(
                            move |mut result: Vec<Value>| {
                                result.pop().unwrap_or(Value::Nil)
                            },
                        )
                    })
                };

                let set = || {
                    int().then_partial(move |&mut length| {
                        if length < 0 {
                            combine::produce(|| Value::Nil).left()
                        } else {
                            let length = length as usize;
                            combine::count_min_max(length, length, value(Some(depth + 1)))
                                .map(Value::Set)
                                .right()
                        }
                    })
                };

                let push = || {
                    int().then_partial(move |&mut length| {
                        if length <= 0 {
                            combine::produce(|| Value::Push {
                                kind: PushKind::Other("".to_string()),
                                data: vec![],
                            })
                            .left()
                        } else {
                            let length = length as usize;
                            combine::count_min_max(length, length, value(Some(depth + 1)))
                                .and_then(|result: Vec<Value>| {
                                    let mut it = result.into_iter();
                                    let first = it.next().unwrap_or(Value::Nil);
                                    let kind = match first {
                                        Value::BulkString(kind) => str::from_utf8(&kind)
                                            .map_err(StreamErrorFor::<I>::other)?
                                            .to_string(),
                                        Value::SimpleString(kind) => kind,
                                        _ => {
                                            return Err(
                                                StreamErrorFor::<I>::message_static_message(
                                                    "parse error when decoding push",
                                                ),
                                            )
                                        }
                                    };
                                    Ok(Value::Push {
                                        kind: push_kind_from_str(&kind),
                                        data: it.collect(),
                                    })
                                })
                                .right()
                        }
                    })
                };

                let null = || line().map(|_| Value::Nil);

                let double = || {
                    line().and_then(|line| {
                        line.trim()
                            .parse::<f64>()
                            .map_err(StreamErrorFor::<I>::other)
                    })
                };

                let boolean = || {
                    line().and_then(|line: &str| match line {
                        "t" => Ok(true),
                        "f" => Ok(false),
                        _ => Err(StreamErrorFor::<I>::message_static_message(
                            "Expected boolean, got garbage",
                        )),
                    })
                };

                let blob_error = || blob().map(|line| err_parser(&line));

                let verbatim = || {
                    blob().and_then(|line| {
                        if let Some((format, text)) = line.split_once(':') {
                            let format = match format {
                                "txt" => VerbatimFormat::Text,
                                "mkd" => VerbatimFormat::Markdown,
                                x => VerbatimFormat::Unknown(x.to_string()),
                            };
                            Ok(Value::VerbatimString {
                                format,
                                text: text.to_string(),
                            })
                        } else {
                            Err(StreamErrorFor::<I>::message_static_message(
                                "parse error when decoding verbatim string",
                            ))
                        }
                    })
                };

                let big_number = || {
                    line().and_then(|line| {
                        BigInt::parse_bytes(line.as_bytes(), 10).ok_or_else(|| {
                            StreamErrorFor::<I>::message_static_message(
                                "Expected bigint, got garbage",
                            )
                        })
                    })
                };

                combine::dispatch!(b;
                    b'+' => simple_string(),
                    b':' => int().map(Value::Int),
                    b'$' => bulk_string(),
                    b'*' => array(),
                    b'%' => map(),
                    b'|' => attribute(),
                    b'~' => set(),
                    b'-' => error().map(Value::ServerError),
                    b'_' => null(),
                    b',' => double().map(Value::Double),
                    b'#' => boolean().map(Value::Boolean),
                    b'!' => blob_error().map(Value::ServerError),
                    b'=' => verbatim(),
                    b'(' => big_number().map(Value::BigNumber),
                    b'>' => push(),
                    b => combine::unexpected_any(combine::error::Token(b))
                )
            })
    ))
}

/// A codec that decodes the stream of RESP frames into [`Value`]s and passes
/// pre-packed commands through unchanged on the write side.
///
/// Partial frames keep their parse state between calls, so a frame split
/// across reads resumes where it stopped instead of rescanning.  Any
/// malformed byte yields a [`ErrorKind::ParseError`]; the connection owning
/// the codec must be closed after that, recovery is not attempted.
#[derive(Default)]
pub struct ValueCodec {
    state: AnySendSyncPartialState,
}

impl ValueCodec {
    fn decode_stream(&mut self, bytes: &mut BytesMut, eof: bool) -> RedisResult<Option<Value>> {
        let (opt, removed_len) = {
            let buffer = &bytes[..];
            let mut stream = combine::easy::Stream(combine::stream::MaybePartialStream(
                buffer, !eof,
            ));
            match combine::stream::decode(value(None), &mut stream, &mut self.state) {
                Ok(x) => x,
                Err(err) => {
                    let err = err
                        .map_position(|pos| pos.translate_position(buffer))
                        .map_range(|range| format!("{range:?}"))
                        .to_string();
                    return Err(RedisError::from((ErrorKind::ParseError, "parse error", err)));
                }
            }
        };

        bytes.advance(removed_len);
        Ok(opt)
    }
}

impl Encoder<Vec<u8>> for ValueCodec {
    type Error = RedisError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_ref());
        Ok(())
    }
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = RedisError;

    fn decode(&mut self, bytes: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_stream(bytes, false)
    }

    fn decode_eof(&mut self, bytes: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_stream(bytes, true)
    }
}

/// Parses a single value out of a complete byte buffer.
///
/// This is the most straightforward way to turn raw protocol bytes into a
/// [`Value`]; the connection types use the incremental [`ValueCodec`]
/// instead.  Note that in-band server errors come back as
/// [`Value::ServerError`], not as `Err`.
pub fn parse_redis_value(bytes: &[u8]) -> RedisResult<Value> {
    let mut codec = ValueCodec::default();
    let mut buffer = BytesMut::from(bytes);
    match codec.decode_eof(&mut buffer)? {
        Some(value) => Ok(value),
        None => Err(RedisError::from((
            ErrorKind::ParseError,
            "parse error",
            "unexpected end of input".to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut ValueCodec, bytes: &mut BytesMut) -> Vec<Value> {
        let mut out = vec![];
        while let Some(value) = codec.decode(bytes).unwrap() {
            out.push(value);
        }
        out
    }

    #[test]
    fn decode_simple_types() {
        assert_eq!(parse_redis_value(b"+OK\r\n").unwrap(), Value::Okay);
        assert_eq!(
            parse_redis_value(b"+PONG\r\n").unwrap(),
            Value::SimpleString("PONG".to_string())
        );
        assert_eq!(parse_redis_value(b":42\r\n").unwrap(), Value::Int(42));
        assert_eq!(parse_redis_value(b":-42\r\n").unwrap(), Value::Int(-42));
        assert_eq!(
            parse_redis_value(b"$5\r\nhello\r\n").unwrap(),
            Value::BulkString(b"hello".to_vec())
        );
    }

    #[test]
    fn bulk_strings_are_binary_safe() {
        assert_eq!(
            parse_redis_value(b"$7\r\nfoo\r\nba\r\n").unwrap(),
            Value::BulkString(b"foo\r\nba".to_vec())
        );
        assert_eq!(
            parse_redis_value(b"$3\r\n\x00\x01\x02\r\n").unwrap(),
            Value::BulkString(vec![0, 1, 2])
        );
    }

    #[test]
    fn null_bulk_and_null_array_are_distinct() {
        assert_eq!(parse_redis_value(b"$-1\r\n").unwrap(), Value::Nil);
        assert_eq!(parse_redis_value(b"*-1\r\n").unwrap(), Value::NilArray);
        assert_ne!(Value::Nil, Value::NilArray);
    }

    #[test]
    fn decode_nested_array() {
        assert_eq!(
            parse_redis_value(b"*3\r\n$3\r\nfoo\r\n:2\r\n*1\r\n+bar\r\n").unwrap(),
            Value::Array(vec![
                Value::BulkString(b"foo".to_vec()),
                Value::Int(2),
                Value::Array(vec![Value::SimpleString("bar".to_string())]),
            ])
        );
    }

    #[test]
    fn server_errors_stay_in_band() {
        let value = parse_redis_value(b"-WRONGTYPE Operation against a key\r\n").unwrap();
        let err = value.extract_error().unwrap_err();
        assert_eq!(err.code(), Some("WRONGTYPE"));

        let value = parse_redis_value(b"-MOVED 1234 127.0.0.1:6380\r\n").unwrap();
        let err = value.extract_error().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Moved);
        assert_eq!(err.redirect_node(), Some(("127.0.0.1", 6380)));
    }

    #[test]
    fn errors_nested_in_arrays_survive() {
        let value = parse_redis_value(b"*2\r\n+OK\r\n-ERR boom\r\n").unwrap();
        let items = value.into_sequence().unwrap();
        assert_eq!(items[0], Value::Okay);
        assert!(matches!(items[1], Value::ServerError(_)));
    }

    #[test]
    fn decode_resp3_map_and_set() {
        assert_eq!(
            parse_redis_value(b"%2\r\n+first\r\n:1\r\n+second\r\n:2\r\n").unwrap(),
            Value::Map(vec![
                (Value::SimpleString("first".to_string()), Value::Int(1)),
                (Value::SimpleString("second".to_string()), Value::Int(2)),
            ])
        );
        assert_eq!(
            parse_redis_value(b"~3\r\n+a\r\n#t\r\n:7\r\n").unwrap(),
            Value::Set(vec![
                Value::SimpleString("a".to_string()),
                Value::Boolean(true),
                Value::Int(7),
            ])
        );
    }

    #[test]
    fn decode_resp3_scalars() {
        assert_eq!(parse_redis_value(b"_\r\n").unwrap(), Value::Nil);
        assert_eq!(parse_redis_value(b"#t\r\n").unwrap(), Value::Boolean(true));
        assert_eq!(parse_redis_value(b"#f\r\n").unwrap(), Value::Boolean(false));
        assert!(parse_redis_value(b"#x\r\n").is_err());
        assert_eq!(
            parse_redis_value(b",1.23\r\n").unwrap(),
            Value::Double(1.23)
        );
        assert_eq!(
            parse_redis_value(b",-inf\r\n").unwrap(),
            Value::Double(f64::NEG_INFINITY)
        );
        assert_eq!(
            parse_redis_value(b"(3492890328409238509324850943850943825024385\r\n").unwrap(),
            Value::BigNumber(
                BigInt::parse_bytes(b"3492890328409238509324850943850943825024385", 10).unwrap()
            )
        );
    }

    #[test]
    fn decode_resp3_verbatim_string() {
        assert_eq!(
            parse_redis_value(b"=15\r\ntxt:Some string\r\n").unwrap(),
            Value::VerbatimString {
                format: VerbatimFormat::Text,
                text: "Some string".to_string(),
            }
        );
    }

    #[test]
    fn decode_resp3_push() {
        let value =
            parse_redis_value(b">3\r\n+message\r\n+somechannel\r\n+this is the message\r\n")
                .unwrap();
        match value {
            Value::Push { kind, data } => {
                assert_eq!(kind, PushKind::Message);
                assert_eq!(data[0], Value::SimpleString("somechannel".to_string()));
                assert_eq!(
                    data[1],
                    Value::SimpleString("this is the message".to_string())
                );
            }
            other => panic!("expected push, got {other:?}"),
        }
    }

    #[test]
    fn decode_resp3_blob_error() {
        let value = parse_redis_value(b"!21\r\nSYNTAX invalid syntax\r\n").unwrap();
        let err = value.extract_error().unwrap_err();
        assert_eq!(err.code(), Some("SYNTAX"));
    }

    #[test]
    fn attribute_frames_are_consumed() {
        // |1<kv>:1764 prefixes the actual reply, which must come out alone.
        let bytes = b"|1\r\n+key-popularity\r\n:1764\r\n$5\r\nhello\r\n";
        assert_eq!(
            parse_redis_value(bytes).unwrap(),
            Value::BulkString(b"hello".to_vec())
        );
    }

    #[test]
    fn streamed_chunks_equal_whole_buffer() {
        let stream: &[u8] =
            b"+OK\r\n*2\r\n$3\r\nfoo\r\n:42\r\n%1\r\n+k\r\n$1\r\nv\r\n$-1\r\n:7\r\n";
        let expected = {
            let mut codec = ValueCodec::default();
            let mut buffer = BytesMut::from(stream);
            decode_all(&mut codec, &mut buffer)
        };
        assert_eq!(expected.len(), 5);

        // Every two-way split must produce the same value sequence.
        for split in 1..stream.len() {
            let mut codec = ValueCodec::default();
            let mut buffer = BytesMut::from(&stream[..split]);
            let mut values = decode_all(&mut codec, &mut buffer);
            buffer.extend_from_slice(&stream[split..]);
            values.extend(decode_all(&mut codec, &mut buffer));
            assert_eq!(values, expected, "split at {split}");
        }

        // And so must feeding one byte at a time.
        let mut codec = ValueCodec::default();
        let mut buffer = BytesMut::new();
        let mut values = vec![];
        for byte in stream {
            buffer.extend_from_slice(&[*byte]);
            values.extend(decode_all(&mut codec, &mut buffer));
        }
        assert_eq!(values, expected);
    }

    #[test]
    fn oversized_bulk_length_is_rejected() {
        assert!(parse_redis_value(b"$536870913\r\n").is_err());
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let mut bytes = Vec::new();
        for _ in 0..MAX_RECURSE_DEPTH + 2 {
            bytes.extend_from_slice(b"*1\r\n");
        }
        bytes.extend_from_slice(b":1\r\n");
        match parse_redis_value(&bytes) {
            Ok(_) => panic!("expected parse failure"),
            Err(e) => assert_eq!(e.kind(), ErrorKind::ParseError),
        }
    }

    #[test]
    fn garbage_marker_byte_fails() {
        let err = parse_redis_value(b"@boom\r\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }
}
