//! In-process IPROTO server speaking just enough of the protocol and the
//! `queue` tube procedures for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use rmpv::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::protocol::{ERROR_FLAG, GREETING_LEN, RequestType, encode_packet, key, map_get, read_frame, scramble};

pub(crate) const SALT: [u8; 32] = {
    let mut salt = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        salt[i] = i as u8;
        i += 1;
    }
    salt
};

const ER_NO_SUCH_PROC: u64 = 33;
const ER_ACCESS_DENIED: u64 = 42;
const ER_CREDS_MISMATCH: u64 = 47;
const ER_PROC_LUA: u64 = 32;

#[derive(Default)]
struct Queue {
    ready: VecDeque<(u64, Value)>,
    /// Taken jobs with the connection that took them.
    taken: HashMap<u64, (Value, usize)>,
}

struct State {
    credentials: Option<(String, String)>,
    queue: Mutex<Queue>,
    next_id: AtomicU64,
    calls: Mutex<Vec<String>>,
    connections: AtomicUsize,
    take_stall_ms: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl State {
    /// Like tarantool, return a closed session's taken jobs to the ready state.
    fn requeue(&self, conn: usize) {
        let mut queue = self.queue.lock().unwrap();
        let mut ids: Vec<u64> = queue
            .taken
            .iter()
            .filter(|(_, (_, owner))| *owner == conn)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for id in ids {
            if let Some((data, _)) = queue.taken.remove(&id) {
                queue.ready.push_front((id, data));
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }
}

pub(crate) struct FakeTarantool {
    address: String,
    state: Arc<State>,
    acceptor: JoinHandle<()>,
}

impl FakeTarantool {
    pub(crate) async fn start() -> Self {
        Self::spawn(None).await
    }

    pub(crate) async fn with_credentials(user: &str, password: &str) -> Self {
        Self::spawn(Some((user.to_string(), password.to_string()))).await
    }

    async fn spawn(credentials: Option<(String, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(State {
            credentials,
            queue: Mutex::new(Queue::default()),
            next_id: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            take_stall_ms: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let acceptor = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let conn = state.connections.fetch_add(1, Ordering::SeqCst);
                    let handle = tokio::spawn(serve(stream, state.clone(), conn));
                    state.track(handle);
                }
            })
        };

        Self {
            address,
            state,
            acceptor,
        }
    }

    pub(crate) fn address(&self) -> String {
        self.address.clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Procedure names called so far, in arrival order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.state.queue.lock().unwrap().ready.len()
    }

    pub(crate) fn taken_len(&self) -> usize {
        self.state.queue.lock().unwrap().taken.len()
    }

    /// Put raw metadata straight on the tube, bypassing any client encoding.
    pub(crate) fn put_raw(&self, data: Value) -> u64 {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.queue.lock().unwrap().ready.push_back((id, data));
        id
    }

    /// Delay every `take` reply by `stall` after the job has been taken.
    pub(crate) fn stall_takes(&self, stall: Duration) {
        let ms = u64::try_from(stall.as_millis()).unwrap();
        self.state.take_stall_ms.store(ms, Ordering::SeqCst);
    }

    /// Close every accepted socket; the listener keeps accepting.
    pub(crate) fn drop_connections(&self) {
        for task in self.state.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for FakeTarantool {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.drop_connections();
    }
}

fn greeting() -> Vec<u8> {
    let salt = base64::engine::general_purpose::STANDARD.encode(SALT);
    let mut raw = Vec::with_capacity(GREETING_LEN);
    raw.extend_from_slice(
        format!("{:<63}\n", "Tarantool 2.11.1 (Binary) 00000000-0000-0000-0000-000000000000")
            .as_bytes(),
    );
    raw.extend_from_slice(format!("{:<63}\n", salt).as_bytes());
    raw
}

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

async fn reply(writer: &Writer, sync: u64, result: Result<Value, (u64, String)>) {
    let (code, body) = match result {
        Ok(data) => (0, Value::Map(vec![(Value::from(key::DATA), data)])),
        Err((code, message)) => (
            ERROR_FLAG | code,
            Value::Map(vec![(Value::from(key::ERROR_24), Value::from(message))]),
        ),
    };
    let header = Value::Map(vec![
        (Value::from(key::REQUEST_TYPE), Value::from(code)),
        (Value::from(key::SYNC), Value::from(sync)),
    ]);
    if let Ok(packet) = encode_packet(&header, &body) {
        let _ = writer.lock().await.write_all(&packet).await;
    }
}

async fn serve(stream: TcpStream, state: Arc<State>, conn: usize) {
    let (read_half, mut write_half) = stream.into_split();
    if write_half.write_all(&greeting()).await.is_err() {
        return;
    }
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut reader = BufReader::new(read_half);
    let authenticated = Arc::new(AtomicBool::new(state.credentials.is_none()));

    while let Ok(frame) = read_frame(&mut reader).await {
        let mut cursor = frame.as_slice();
        let Ok(header) = rmpv::decode::read_value(&mut cursor) else {
            break;
        };
        let body = rmpv::decode::read_value(&mut cursor).unwrap_or(Value::Map(Vec::new()));
        let request_type = map_get(&header, key::REQUEST_TYPE).and_then(Value::as_u64);
        let sync = map_get(&header, key::SYNC).and_then(Value::as_u64).unwrap_or(0);

        if request_type == Some(RequestType::Ping.code()) {
            reply(&writer, sync, Ok(Value::Array(Vec::new()))).await;
        } else if request_type == Some(RequestType::Auth.code()) {
            let result = check_auth(&state, &body);
            if result.is_ok() {
                authenticated.store(true, Ordering::SeqCst);
            }
            reply(&writer, sync, result).await;
        } else if request_type == Some(RequestType::Call.code()) {
            if !authenticated.load(Ordering::SeqCst) {
                let denied = Err((ER_ACCESS_DENIED, "Execute access denied for user 'guest'".to_string()));
                reply(&writer, sync, denied).await;
                continue;
            }
            let function = map_get(&body, key::FUNCTION_NAME)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = map_get(&body, key::TUPLE)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            state.calls.lock().unwrap().push(function.clone());

            let (state_for_call, writer) = (state.clone(), writer.clone());
            let handle = tokio::spawn(async move {
                let result = call(&state_for_call, &function, args, conn).await;
                reply(&writer, sync, result).await;
            });
            state.track(handle);
        } else {
            reply(&writer, sync, Err((ER_PROC_LUA, "unsupported request".to_string()))).await;
        }
    }
    state.requeue(conn);
}

fn check_auth(state: &State, body: &Value) -> Result<Value, (u64, String)> {
    let Some((user, password)) = &state.credentials else {
        return Ok(Value::Array(Vec::new()));
    };
    let given_user = map_get(body, key::USER_NAME).and_then(Value::as_str);
    let given_scramble = map_get(body, key::TUPLE)
        .and_then(Value::as_array)
        .and_then(|t| t.get(1))
        .and_then(Value::as_slice);

    let expected = scramble(password, &SALT);
    if given_user == Some(user.as_str()) && given_scramble == Some(&expected[..]) {
        Ok(Value::Array(Vec::new()))
    } else {
        Err((ER_CREDS_MISMATCH, "Incorrect password supplied for user".to_string()))
    }
}

fn tuple(id: u64, state: &str, data: Value) -> Value {
    Value::Array(vec![Value::from(id), Value::from(state), data])
}

fn arg_id(args: &[Value]) -> Result<u64, (u64, String)> {
    args.first()
        .and_then(Value::as_u64)
        .ok_or((ER_PROC_LUA, "task id expected".to_string()))
}

async fn call(
    state: &State,
    function: &str,
    args: Vec<Value>,
    conn: usize,
) -> Result<Value, (u64, String)> {
    let method = function.rsplit(':').next().unwrap_or_default();
    if function == "echo" {
        let delay = args.first().and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        return Ok(Value::Array(args.into_iter().skip(1).collect()));
    }
    if !function.starts_with("queue.tube.") {
        return Err((ER_NO_SUCH_PROC, format!("Procedure '{function}' is not defined")));
    }

    match method {
        "put" => {
            let data = args.into_iter().next().unwrap_or(Value::Nil);
            let id = state.next_id.fetch_add(1, Ordering::SeqCst);
            state.queue.lock().unwrap().ready.push_back((id, data.clone()));
            Ok(Value::Array(vec![tuple(id, "r", data)]))
        }
        "take" => {
            let wait = args.first().and_then(Value::as_f64).unwrap_or(0.0);
            let deadline = Instant::now() + Duration::from_secs_f64(wait.max(0.0));
            loop {
                let popped = {
                    let mut queue = state.queue.lock().unwrap();
                    let popped = queue.ready.pop_front();
                    if let Some((id, data)) = &popped {
                        queue.taken.insert(*id, (data.clone(), conn));
                    }
                    popped
                };
                if let Some((id, data)) = popped {
                    let stall = state.take_stall_ms.load(Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(stall)).await;
                    return Ok(Value::Array(vec![tuple(id, "t", data)]));
                }
                if Instant::now() >= deadline {
                    return Ok(Value::Array(vec![Value::Nil]));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        "ack" => {
            let id = arg_id(&args)?;
            match state.queue.lock().unwrap().taken.remove(&id) {
                Some((data, _)) => Ok(Value::Array(vec![tuple(id, "-", data)])),
                None => Err((ER_PROC_LUA, format!("Task {id} not found"))),
            }
        }
        "release" => {
            let id = arg_id(&args)?;
            let mut queue = state.queue.lock().unwrap();
            match queue.taken.remove(&id) {
                Some((data, _)) => {
                    queue.ready.push_front((id, data.clone()));
                    Ok(Value::Array(vec![tuple(id, "r", data)]))
                }
                None => Err((ER_PROC_LUA, format!("Task {id} not found"))),
            }
        }
        _ => Err((ER_NO_SUCH_PROC, format!("Procedure '{function}' is not defined"))),
    }
}
