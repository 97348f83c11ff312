//! In-process stand-in for a llama.cpp server, plus helpers shared by the
//! integration tests.

#![allow(dead_code)]

use async_stream::stream;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// How the fake upstream answers a completion request.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Sends the chunks and ends the body.
    Chunks(Vec<Vec<u8>>),
    /// Sends the chunks, then nothing at all.
    Stall(Vec<Vec<u8>>),
    /// Sends the chunks, then SSE comments forever.
    Trickle(Vec<Vec<u8>>),
    Status(u16, String),
}

#[derive(Clone)]
struct UpstreamState {
    reply: Reply,
    requests: Arc<Mutex<Vec<Value>>>,
    disconnected: Arc<AtomicBool>,
}

pub struct FakeUpstream {
    pub url: String,
    requests: Arc<Mutex<Vec<Value>>>,
    disconnected: Arc<AtomicBool>,
}

impl FakeUpstream {
    /// Bodies of the completion requests received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    /// Whether a response body was dropped before it ended.
    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub async fn wait_for_disconnect(&self) -> bool {
        for _ in 0..200 {
            if self.disconnected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

struct DisconnectGuard {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

pub async fn spawn_upstream(reply: Reply) -> FakeUpstream {
    let state = UpstreamState {
        reply,
        requests: Arc::new(Mutex::new(Vec::new())),
        disconnected: Arc::new(AtomicBool::new(false)),
    };
    let upstream = FakeUpstream {
        url: String::new(),
        requests: state.requests.clone(),
        disconnected: state.disconnected.clone(),
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .route("/v1/models", get(models))
        .with_state(state);

    let address = serve(app).await;

    FakeUpstream {
        url: format!("http://{address}"),
        ..upstream
    }
}

/// Serves `app` on an ephemeral local port.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    address
}

/// An address nothing listens on.
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{address}")
}

async fn completions(State(state): State<UpstreamState>, Json(body): Json<Value>) -> Response {
    state.requests.lock().unwrap().push(body);
    stream_reply(state.reply, state.disconnected)
}

/// Answers with `reply`. `disconnected` is set when the body is dropped
/// before it ended.
pub fn stream_reply(reply: Reply, disconnected: Arc<AtomicBool>) -> Response {
    let (chunks, tail) = match reply {
        Reply::Status(status, body) => {
            return (StatusCode::from_u16(status).unwrap(), body).into_response();
        }
        Reply::Chunks(chunks) => (chunks, Tail::End),
        Reply::Stall(chunks) => (chunks, Tail::Silence),
        Reply::Trickle(chunks) => (chunks, Tail::Comments),
    };

    let mut guard = DisconnectGuard {
        flag: disconnected,
        armed: true,
    };

    let body = stream! {
        for chunk in chunks {
            yield Ok::<_, Infallible>(chunk);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        match tail {
            Tail::End => guard.armed = false,
            Tail::Silence => std::future::pending::<()>().await,
            Tail::Comments => loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                yield Ok(b": ping\n\n".to_vec());
            },
        }
        drop(guard);
    };

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(body))
        .unwrap()
}

#[derive(Clone, Copy)]
enum Tail {
    End,
    Silence,
    Comments,
}

async fn models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [
            { "id": "llama-3.2-3b-instruct", "object": "model", "owned_by": "llamacpp" },
            { "id": "qwen2.5-7b" }
        ]
    }))
}

/// One OpenAI style streaming line carrying `text`.
pub fn fragment(text: &str) -> Vec<u8> {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "index": 0, "delta": { "content": text } }] })
    )
    .into_bytes()
}

pub fn done() -> Vec<u8> {
    b"data: [DONE]\n\n".to_vec()
}

/// A full reply: every text as one fragment, then `[DONE]`.
pub fn reply(texts: &[&str]) -> Vec<Vec<u8>> {
    texts
        .iter()
        .map(|text| fragment(text))
        .chain(std::iter::once(done()))
        .collect()
}
