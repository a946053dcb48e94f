//! streaming chat-completion client.
//!
//! one call = one POST with `stream: true`, decoded increment by increment.
//! exactly one of `on_complete` / `on_failure` fires per call, and no
//! fragment is delivered after it: fragments are only emitted from inside
//! the decode loop, and the terminal callback is chosen from its result.
//!
//! native builds read the body through a blocking [`Transport`] (run it off
//! the main thread); wasm builds read the fetch `ReadableStream` directly.

use std::sync::Arc;

use bevy::log::{debug, info, warn};
use bevy::prelude::Resource;
use serde::Serialize;

use crate::config::ChatConfig;
use crate::error::StreamError;
use crate::protocol::ProtocolEvent;
use crate::turn::{Turn, WireMessage};

#[cfg(not(target_arch = "wasm32"))]
pub use native::{HttpRequest, Transport, UreqTransport};

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

/// streams completions for a turn snapshot; cheap to clone into workers.
#[derive(Resource, Clone)]
pub struct StreamClient {
    config: Arc<ChatConfig>,
    #[cfg(not(target_arch = "wasm32"))]
    transport: Arc<dyn Transport>,
}

impl StreamClient {
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn request_body(&self, turns: &[Turn]) -> Result<Vec<u8>, StreamError> {
        if turns.is_empty() {
            warn!(target: "bevy_chat_stream", "stream_completion called with no turns");
        }
        let body = CompletionBody {
            model: &self.config.model,
            messages: turns.iter().map(Turn::as_wire).collect(),
            stream: true,
        };
        Ok(serde_json::to_vec(&body)?)
    }
}

/// hand decoded events to the fragment callback; true once `[DONE]` is seen.
fn dispatch(events: Vec<ProtocolEvent>, on_fragment: &mut dyn FnMut(&str)) -> bool {
    for ev in events {
        match ev {
            ProtocolEvent::Delta(text) => on_fragment(&text),
            ProtocolEvent::Done => return true,
            ProtocolEvent::Discarded(raw) => {
                debug!(target: "bevy_chat_stream", "dropping unparseable event ({} bytes)", raw.len());
            }
        }
    }
    false
}

fn settle(
    result: Result<(), StreamError>,
    on_complete: impl FnOnce(),
    on_failure: impl FnOnce(StreamError),
) {
    match result {
        Ok(()) => {
            info!(target: "bevy_chat_stream", "stream completed");
            on_complete();
        }
        Err(err) => {
            warn!(target: "bevy_chat_stream", "stream failed: {err}");
            on_failure(err);
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::io::{ErrorKind, Read};
    use std::sync::Arc;

    use bevy::log::info;

    use super::{StreamClient, dispatch, settle};
    use crate::config::ChatConfig;
    use crate::error::StreamError;
    use crate::protocol::StreamDecoder;
    use crate::turn::Turn;

    const READ_CHUNK: usize = 8 * 1024;

    pub struct HttpRequest<'a> {
        pub url: &'a str,
        pub credential: &'a str,
        pub body: Vec<u8>,
    }

    /// opens the POST and hands back the response body, or fails on a
    /// non-success status / transport error before any byte is read.
    pub trait Transport: Send + Sync {
        fn open(&self, request: HttpRequest<'_>) -> Result<Box<dyn Read>, StreamError>;
    }

    pub struct UreqTransport {
        agent: ureq::Agent,
    }

    impl UreqTransport {
        pub fn new(agent: ureq::Agent) -> Self {
            Self { agent }
        }
    }

    impl Default for UreqTransport {
        fn default() -> Self {
            // statuses are checked here so a 5xx maps to `StreamError::Status`
            let config = ureq::Agent::config_builder().http_status_as_error(false).build();
            Self::new(ureq::Agent::new_with_config(config))
        }
    }

    impl Transport for UreqTransport {
        fn open(&self, request: HttpRequest<'_>) -> Result<Box<dyn Read>, StreamError> {
            let response = self
                .agent
                .post(request.url)
                .header("Authorization", format!("Bearer {}", request.credential))
                .header("Content-Type", "application/json")
                .send(&request.body[..])
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(StreamError::Status(status.as_u16()));
            }
            Ok(Box::new(response.into_body().into_reader()))
        }
    }

    impl StreamClient {
        pub fn new(config: ChatConfig) -> Self {
            Self::with_transport(config, UreqTransport::default())
        }

        pub fn with_transport(config: ChatConfig, transport: impl Transport + 'static) -> Self {
            Self { config: Arc::new(config), transport: Arc::new(transport) }
        }

        /// blocking: run on a worker thread, never on the main schedule.
        pub fn stream_completion(
            &self,
            turns: &[Turn],
            mut on_fragment: impl FnMut(&str),
            on_complete: impl FnOnce(),
            on_failure: impl FnOnce(StreamError),
        ) {
            settle(self.run(turns, &mut on_fragment), on_complete, on_failure);
        }

        fn run(&self, turns: &[Turn], on_fragment: &mut dyn FnMut(&str)) -> Result<(), StreamError> {
            let body = self.request_body(turns)?;
            info!(
                target: "bevy_chat_stream",
                "stream_completion: url={} model={} turns={} credential_present={}",
                self.config.chat_url, self.config.model, turns.len(), !self.config.credential.is_empty()
            );
            let mut reader = self.transport.open(HttpRequest {
                url: &self.config.chat_url,
                credential: &self.config.credential,
                body,
            })?;

            let mut decoder = StreamDecoder::new(self.config.framing);
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                if dispatch(decoder.feed(&buf[..n]), on_fragment) {
                    return Ok(());
                }
            }
            dispatch(decoder.finish(), on_fragment);
            Ok(())
        }
    }
}

#[cfg(target_arch = "wasm32")]
mod web {
    use std::sync::Arc;

    use bevy::log::info;
    use gloo_net::http::Request;
    use wasm_bindgen::{JsCast, JsValue};
    use wasm_bindgen_futures::JsFuture;
    use web_sys::ReadableStreamDefaultReader;

    use super::{StreamClient, dispatch, settle};
    use crate::config::ChatConfig;
    use crate::error::StreamError;
    use crate::protocol::StreamDecoder;
    use crate::turn::Turn;

    fn read_err(err: JsValue) -> StreamError {
        StreamError::Read(format!("{err:?}"))
    }

    fn field(obj: &JsValue, name: &str) -> Result<JsValue, StreamError> {
        js_sys::Reflect::get(obj, &JsValue::from_str(name)).map_err(read_err)
    }

    impl StreamClient {
        pub fn new(config: ChatConfig) -> Self {
            Self { config: Arc::new(config) }
        }

        pub async fn stream_completion(
            &self,
            turns: &[Turn],
            mut on_fragment: impl FnMut(&str),
            on_complete: impl FnOnce(),
            on_failure: impl FnOnce(StreamError),
        ) {
            settle(self.run(turns, &mut on_fragment).await, on_complete, on_failure);
        }

        async fn run(&self, turns: &[Turn], on_fragment: &mut dyn FnMut(&str)) -> Result<(), StreamError> {
            let body = String::from_utf8(self.request_body(turns)?)
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            info!(
                target: "bevy_chat_stream",
                "stream_completion (wasm): url={} model={} turns={}",
                self.config.chat_url, self.config.model, turns.len()
            );
            let response = Request::post(&self.config.chat_url)
                .header("Authorization", &format!("Bearer {}", self.config.credential))
                .header("Content-Type", "application/json")
                .body(body)
                .map_err(|e| StreamError::Transport(e.to_string()))?
                .send()
                .await
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            if !response.ok() {
                return Err(StreamError::Status(response.status()));
            }
            let reader: ReadableStreamDefaultReader =
                response.body().ok_or(StreamError::MissingBody)?.get_reader().unchecked_into();

            let mut decoder = StreamDecoder::new(self.config.framing);
            loop {
                let chunk = JsFuture::from(reader.read()).await.map_err(read_err)?;
                if field(&chunk, "done")?.as_bool().unwrap_or(false) {
                    break;
                }
                let bytes = js_sys::Uint8Array::new(&field(&chunk, "value")?).to_vec();
                if dispatch(decoder.feed(&bytes), on_fragment) {
                    return Ok(());
                }
            }
            dispatch(decoder.finish(), on_fragment);
            Ok(())
        }
    }
}


#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use std::io::{ErrorKind, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::testing::{ScriptedTransport, Step, bytes};
    use super::*;
    use crate::protocol::FramingMode;
    use crate::turn::{Role, TurnId};

    const HI: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";

    #[derive(Debug, Default, PartialEq)]
    struct Outcome {
        fragments: Vec<String>,
        completed: usize,
        failures: Vec<String>,
        fragment_after_terminal: bool,
    }

    fn run(client: &StreamClient, turns: &[Turn]) -> Outcome {
        use std::cell::RefCell;
        let out = RefCell::new(Outcome::default());
        client.stream_completion(
            turns,
            |t| {
                let mut o = out.borrow_mut();
                if o.completed > 0 || !o.failures.is_empty() {
                    o.fragment_after_terminal = true;
                }
                o.fragments.push(t.to_string());
            },
            || out.borrow_mut().completed += 1,
            |e| out.borrow_mut().failures.push(e.to_string()),
        );
        out.into_inner()
    }

    fn user(text: &str) -> Vec<Turn> {
        vec![Turn::new(TurnId(0), Role::User, text)]
    }

    fn scripted(transport: ScriptedTransport) -> StreamClient {
        StreamClient::with_transport(ChatConfig::default().with_credential("secret"), transport)
    }

    #[test]
    fn single_increment_delivers_fragment_then_completes() {
        let client = scripted(ScriptedTransport::default().respond(vec![bytes(HI)]));
        let out = run(&client, &user("hello"));
        assert_eq!(out.fragments, vec!["Hi".to_string()]);
        assert_eq!(out.completed, 1);
        assert!(out.failures.is_empty());
    }

    #[test]
    fn torn_line_is_dropped_without_error() {
        let (a, b) = HI.split_at(HI.find("con").unwrap());
        let client = scripted(ScriptedTransport::default().respond(vec![bytes(a), bytes(b)]));
        let out = run(&client, &user("hello"));
        assert!(out.fragments.is_empty());
        assert_eq!(out.completed, 1);
        assert!(out.failures.is_empty());
    }

    #[test]
    fn buffered_framing_recovers_torn_line() {
        let (a, b) = HI.split_at(HI.find("con").unwrap());
        let transport = ScriptedTransport::default().respond(vec![bytes(a), bytes(b)]);
        let client = StreamClient::with_transport(
            ChatConfig::default().with_framing(FramingMode::Buffered),
            transport,
        );
        let out = run(&client, &user("hello"));
        assert_eq!(out.fragments, vec!["Hi".to_string()]);
        assert_eq!(out.completed, 1);
    }

    #[test]
    fn done_stops_reading_further_increments() {
        let transport = ScriptedTransport::default().respond(vec![
            bytes(HI),
            bytes("data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n"),
        ]);
        let client = scripted(transport.clone());
        let out = run(&client, &user("hello"));
        assert_eq!(out.fragments, vec!["Hi".to_string()]);
        assert_eq!(transport.reads(), 1);
    }

    #[test]
    fn exhausted_body_without_done_completes() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n";
        let client = scripted(ScriptedTransport::default().respond(vec![bytes(body)]));
        let out = run(&client, &user("hello"));
        assert_eq!(out.fragments, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(out.completed, 1);
    }

    #[test]
    fn http_failure_calls_only_on_failure() {
        let client = scripted(ScriptedTransport::default().fail(StreamError::Status(500)));
        let out = run(&client, &user("hello"));
        assert_eq!(
            out,
            Outcome { failures: vec!["API Error: 500".into()], ..Default::default() }
        );
    }

    #[test]
    fn read_error_mid_stream_fails_once() {
        let transport = ScriptedTransport::default().respond(vec![
            bytes("data: {\"choices\":[{\"delta\":{\"content\":\"part\"}}]}\n"),
            Step::Fail(ErrorKind::ConnectionReset),
        ]);
        let out = run(&scripted(transport), &user("hello"));
        assert_eq!(out.fragments, vec!["part".to_string()]);
        assert_eq!(out.completed, 0);
        assert_eq!(out.failures.len(), 1);
        assert!(!out.fragment_after_terminal);
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let transport = ScriptedTransport::default()
            .respond(vec![Step::Fail(ErrorKind::Interrupted), bytes(HI)]);
        let out = run(&scripted(transport), &user("hello"));
        assert_eq!(out.fragments, vec!["Hi".to_string()]);
        assert_eq!(out.completed, 1);
    }

    #[test]
    fn request_carries_wire_messages_and_stream_flag() {
        let transport = ScriptedTransport::default().respond(vec![bytes(HI)]);
        let client = scripted(transport.clone());
        let mut turns = vec![
            Turn::new(TurnId(0), Role::Assistant, "welcome"),
            Turn::new(TurnId(1), Role::User, "hi there"),
        ];
        turns[1].is_streaming = true;
        run(&client, &turns);

        let captured = transport.captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].url, client.config().chat_url);
        assert_eq!(captured[0].credential, "secret");
        assert_eq!(
            captured[0].body,
            serde_json::json!({
                "model": "gemini-flash",
                "messages": [
                    { "role": "assistant", "content": "welcome" },
                    { "role": "user", "content": "hi there" },
                ],
                "stream": true,
            })
        );
    }

    // --- loopback http, exercising the ureq transport end to end ---

    fn read_request(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).unwrap_or(0);
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let lower = text.to_ascii_lowercase();
                let want = lower
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok());
                let have = raw.len() - (end + 4);
                match want {
                    Some(len) if have >= len => break,
                    None if lower.contains("transfer-encoding: chunked") => {
                        if text.ends_with("0\r\n\r\n") {
                            break;
                        }
                    }
                    None => break,
                    _ => {}
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    /// serve exactly one request with `response`; returns the url and a
    /// handle yielding the raw request text.
    fn serve_once(response: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            request
        });
        (format!("http://{addr}/v1/chat/completions"), handle)
    }

    fn loopback_client(url: String) -> StreamClient {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .proxy(None)
            .build();
        StreamClient::with_transport(
            ChatConfig::default()
                .with_credential("secret")
                .with_chat_url(url)
                .with_framing(FramingMode::Buffered),
            UreqTransport::new(ureq::Agent::new_with_config(config)),
        )
    }

    #[test]
    fn ureq_transport_streams_fragments() {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{HI}",
            HI.len()
        );
        let (url, server) = serve_once(response);
        let out = run(&loopback_client(url), &user("hello"));
        assert_eq!(out.fragments, vec!["Hi".to_string()]);
        assert_eq!(out.completed, 1);

        let request = server.join().unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(lower.starts_with("post /v1/chat/completions"));
        assert!(lower.contains("authorization: bearer secret"));
        assert!(lower.contains("content-type: application/json"));
        assert!(request.contains("\"stream\":true"));
    }

    #[test]
    fn ureq_transport_maps_server_error_to_failure() {
        let response =
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
        let (url, server) = serve_once(response);
        let out = run(&loopback_client(url), &user("hello"));
        assert!(out.fragments.is_empty());
        assert_eq!(out.completed, 0);
        assert_eq!(out.failures, vec!["API Error: 500".to_string()]);
        server.join().unwrap();
    }

    #[test]
    fn ureq_transport_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let out = run(&loopback_client(format!("http://{addr}/")), &user("hello"));
        assert_eq!(out.completed, 0);
        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].starts_with("transport error"));
    }
}
