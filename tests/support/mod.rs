//! An in-process toy redis server, speaking just enough RESP2 for the
//! integration tests: strings, lists, counters, MULTI/EXEC and pub/sub.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;

use redmux::{Value, ValueCodec};

#[derive(Default)]
struct Store {
    strings: HashMap<Vec<u8>, Vec<u8>>,
    lists: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
    // channel -> subscriber outboxes
    subscribers: HashMap<Vec<u8>, Vec<UnboundedSender<Vec<u8>>>>,
}

pub struct TestServer {
    addr: SocketAddr,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Mutex::new(Store::default()));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Default::default();

        let tasks_for_accept = Arc::clone(&tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let store = Arc::clone(&store);
                let handle = tokio::spawn(handle_client(socket, store));
                tasks_for_accept.lock().unwrap().push(handle);
            }
        });

        TestServer {
            addr,
            tasks,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// Tears the server down, dropping every open connection.
    pub fn close(&self) {
        self.accept_task.abort();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Okay => out.extend_from_slice(b"+OK\r\n"),
        Value::SimpleString(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::Int(i) => {
            out.push(b':');
            out.extend_from_slice(i.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Value::BulkString(data) => {
            out.push(b'$');
            out.extend_from_slice(data.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        Value::Nil => out.extend_from_slice(b"$-1\r\n"),
        Value::NilArray => out.extend_from_slice(b"*-1\r\n"),
        Value::Array(items) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
        other => panic!("toy server cannot encode {other:?}"),
    }
}

fn error_line(message: &str) -> Vec<u8> {
    format!("-{message}\r\n").into_bytes()
}

fn arguments(value: Value) -> Option<Vec<Vec<u8>>> {
    let items = match value {
        Value::Array(items) => items,
        _ => return None,
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::BulkString(bytes) => Some(bytes),
            Value::SimpleString(s) => Some(s.into_bytes()),
            _ => None,
        })
        .collect()
}

// Applies a data command against the store; pub/sub and connection control
// are handled by the caller.
fn apply(store: &mut Store, args: &[Vec<u8>]) -> Result<Value, String> {
    let keyword = args[0].to_ascii_uppercase();
    match keyword.as_slice() {
        b"SET" if args.len() >= 3 => {
            store.strings.insert(args[1].clone(), args[2].clone());
            Ok(Value::Okay)
        }
        b"GET" if args.len() == 2 => Ok(match store.strings.get(&args[1]) {
            Some(value) => Value::BulkString(value.clone()),
            None => Value::Nil,
        }),
        b"DEL" if args.len() >= 2 => {
            let mut removed = 0;
            for key in &args[1..] {
                if store.strings.remove(key).is_some() || store.lists.remove(key).is_some() {
                    removed += 1;
                }
            }
            Ok(Value::Int(removed))
        }
        b"EXISTS" if args.len() >= 2 => {
            let mut found = 0;
            for key in &args[1..] {
                if store.strings.contains_key(key) || store.lists.contains_key(key) {
                    found += 1;
                }
            }
            Ok(Value::Int(found))
        }
        b"INCR" if args.len() == 2 => {
            let current = match store.strings.get(&args[1]) {
                Some(value) => std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or("ERR value is not an integer or out of range")?,
                None => 0,
            };
            let next = current + 1;
            store
                .strings
                .insert(args[1].clone(), next.to_string().into_bytes());
            Ok(Value::Int(next))
        }
        b"LPUSH" | b"RPUSH" if args.len() >= 3 => {
            let list = store.lists.entry(args[1].clone()).or_default();
            for value in &args[2..] {
                if keyword == b"LPUSH" {
                    list.push_front(value.clone());
                } else {
                    list.push_back(value.clone());
                }
            }
            Ok(Value::Int(list.len() as i64))
        }
        b"RPOP" if args.len() == 2 => Ok(match store.lists.get_mut(&args[1]) {
            Some(list) => match list.pop_back() {
                Some(value) => {
                    if list.is_empty() {
                        store.lists.remove(&args[1]);
                    }
                    Value::BulkString(value)
                }
                None => Value::Nil,
            },
            None => Value::Nil,
        }),
        b"LLEN" if args.len() == 2 => Ok(Value::Int(
            store.lists.get(&args[1]).map_or(0, VecDeque::len) as i64,
        )),
        b"LRANGE" if args.len() == 4 => {
            let list = store.lists.get(&args[1]).cloned().unwrap_or_default();
            let parse = |raw: &[u8]| -> Result<isize, String> {
                std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| "ERR value is not an integer or out of range".to_string())
            };
            let len = list.len() as isize;
            let clamp = |idx: isize| -> isize {
                if idx < 0 {
                    (len + idx).max(0)
                } else {
                    idx.min(len)
                }
            };
            let start = clamp(parse(&args[2])?) as usize;
            let stop = clamp(parse(&args[3])?) as usize;
            let items = list
                .iter()
                .skip(start)
                .take(stop.saturating_sub(start) + 1)
                .map(|item| Value::BulkString(item.clone()))
                .collect();
            Ok(Value::Array(items))
        }
        b"PING" => Ok(Value::SimpleString("PONG".to_string())),
        b"ECHO" if args.len() == 2 => Ok(Value::BulkString(args[1].clone())),
        b"SELECT" | b"AUTH" | b"CLIENT" => Ok(Value::Okay),
        _ => Err(format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(&args[0])
        )),
    }
}

async fn handle_client(socket: TcpStream, store: Arc<Mutex<Store>>) {
    let mut framed = ValueCodec::default().framed(socket);
    let (push_tx, mut push_rx) = unbounded_channel::<Vec<u8>>();
    let mut queued: Option<Vec<Vec<Vec<u8>>>> = None;
    let mut subscribed_count: i64 = 0;

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            push = push_rx.recv() => {
                if let Some(bytes) = push {
                    if framed.send(bytes).await.is_err() {
                        return;
                    }
                }
                continue;
            }
        };

        let value = match frame {
            Some(Ok(value)) => value,
            _ => return,
        };
        let Some(args) = arguments(value) else {
            let _ = framed.send(error_line("ERR protocol error")).await;
            return;
        };
        if args.is_empty() {
            continue;
        }
        let keyword = args[0].to_ascii_uppercase();

        let reply: Vec<u8> = match keyword.as_slice() {
            b"MULTI" => {
                queued = Some(Vec::new());
                b"+OK\r\n".to_vec()
            }
            b"EXEC" => match queued.take() {
                Some(commands) => {
                    let mut out = Vec::new();
                    out.extend_from_slice(format!("*{}\r\n", commands.len()).as_bytes());
                    let mut store = store.lock().unwrap();
                    for command in &commands {
                        match apply(&mut store, command) {
                            Ok(value) => encode_value(&value, &mut out),
                            Err(message) => out.extend_from_slice(&error_line(&message)),
                        }
                    }
                    out
                }
                None => error_line("ERR EXEC without MULTI"),
            },
            b"DISCARD" => {
                queued = None;
                b"+OK\r\n".to_vec()
            }
            b"SUBSCRIBE" if args.len() >= 2 => {
                let mut out = Vec::new();
                let mut store = store.lock().unwrap();
                for channel in &args[1..] {
                    store
                        .subscribers
                        .entry(channel.clone())
                        .or_default()
                        .push(push_tx.clone());
                    subscribed_count += 1;
                    encode_value(
                        &Value::Array(vec![
                            Value::BulkString(b"subscribe".to_vec()),
                            Value::BulkString(channel.clone()),
                            Value::Int(subscribed_count),
                        ]),
                        &mut out,
                    );
                }
                out
            }
            b"UNSUBSCRIBE" if args.len() >= 2 => {
                let mut out = Vec::new();
                let mut store = store.lock().unwrap();
                for channel in &args[1..] {
                    store.subscribers.remove(channel);
                    subscribed_count = (subscribed_count - 1).max(0);
                    encode_value(
                        &Value::Array(vec![
                            Value::BulkString(b"unsubscribe".to_vec()),
                            Value::BulkString(channel.clone()),
                            Value::Int(subscribed_count),
                        ]),
                        &mut out,
                    );
                }
                out
            }
            b"PUBLISH" if args.len() == 3 => {
                let mut receivers = 0;
                let mut store = store.lock().unwrap();
                if let Some(listeners) = store.subscribers.get_mut(&args[1]) {
                    let mut message = Vec::new();
                    encode_value(
                        &Value::Array(vec![
                            Value::BulkString(b"message".to_vec()),
                            Value::BulkString(args[1].clone()),
                            Value::BulkString(args[2].clone()),
                        ]),
                        &mut message,
                    );
                    listeners.retain(|listener| listener.send(message.clone()).is_ok());
                    receivers = listeners.len() as i64;
                }
                let mut out = Vec::new();
                encode_value(&Value::Int(receivers), &mut out);
                out
            }
            _ => {
                if let Some(queue) = queued.as_mut() {
                    queue.push(args);
                    b"+QUEUED\r\n".to_vec()
                } else {
                    let mut store = store.lock().unwrap();
                    match apply(&mut store, &args) {
                        Ok(value) => {
                            let mut out = Vec::new();
                            encode_value(&value, &mut out);
                            out
                        }
                        Err(message) => error_line(&message),
                    }
                }
            }
        };

        if framed.send(reply).await.is_err() {
            return;
        }
    }
}
