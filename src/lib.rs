//! bevy_chat_stream: a small bevy chat front-end core.
//!
//! - streams `data:` completion chunks from an openai-style endpoint and
//!   re-emits them as bevy events.
//! - `/image <prompt>` builds an image url instead and appends it as a turn.
//! - each `ChatSession` owns its turn list and allows one in-flight stream.
//! - never blocks the main thread: on native the blocking http read runs on a
//!   tiny tokio runtime's blocking pool; on wasm we use bevy's async pool,
//!   which yields to the browser/event loop.

use bevy::prelude::*;
use flume::{Receiver, Sender, TryRecvError};
#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;

pub mod client;
pub mod config;
pub mod error;
pub mod image;
pub mod protocol;
pub mod turn;

pub use client::StreamClient;
#[cfg(not(target_arch = "wasm32"))]
pub use client::{HttpRequest, Transport, UreqTransport};
pub use config::ChatConfig;
pub use error::StreamError;
pub use image::{ImageConfig, ImageRequest, build_image_url};
pub use protocol::{FramingMode, ProtocolEvent, StreamDecoder};
pub use turn::{Role, Turn, TurnId, WireMessage};

/// text shown in place of an assistant turn whose stream failed.
pub const ERROR_TEXT: &str = "Error connecting to API.";
/// welcome turn for `ChatSession::with_greeting()`.
pub const GREETING: &str = "Hello. Type normally for text or start with /image for art.";
const IMAGE_COMMAND: &str = "/image ";

/// on native we keep a tiny tokio runtime whose blocking pool runs the
/// streaming reads, so neither the main thread nor bevy's pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_chat_stream", "ChatStreamPlugin: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// bevy_chat_stream emits Chat* events here (in `Update`)
    Drain,
}

/// what a line of user input asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Text(String),
    Image(String),
}

impl Submission {
    /// trims the input; `None` when nothing is left. a case-insensitive
    /// `/image ` prefix routes the remainder to the image path.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        let prefix = IMAGE_COMMAND.len();
        match input.get(..prefix) {
            Some(head) if head.eq_ignore_ascii_case(IMAGE_COMMAND) => {
                Some(Self::Image(input[prefix..].to_string()))
            }
            _ => Some(Self::Text(input.to_string())),
        }
    }
}

/// attach this to an entity you want to chat on. owns the turn list.
#[derive(Component, Clone, Debug, Default)]
pub struct ChatSession {
    turns: Vec<Turn>,
    in_flight: Option<TurnId>,
    next_id: u64,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// session seeded with the assistant welcome turn.
    pub fn with_greeting() -> Self {
        let mut session = Self::new();
        session.push_turn(Role::Assistant, GREETING);
        session
    }

    /// true while an assistant turn is still streaming; new sends are rejected.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<TurnId> {
        self.in_flight
    }

    /// the conversation, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn turn(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    fn turn_mut(&mut self, id: TurnId) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.id == id)
    }

    fn alloc_id(&mut self) -> TurnId {
        let id = TurnId(self.next_id);
        self.next_id += 1;
        id
    }

    /// append a finished turn under a freshly allocated id.
    pub fn push_turn(&mut self, role: Role, content: impl Into<String>) -> TurnId {
        let id = self.alloc_id();
        self.turns.push(Turn::new(id, role, content));
        id
    }

    /// append the user turn and an empty streaming assistant turn. returns
    /// the assistant turn id and the snapshot to send (placeholder excluded).
    pub fn begin_text(&mut self, text: impl Into<String>) -> (TurnId, Vec<Turn>) {
        self.push_turn(Role::User, text);
        let snapshot = self.turns.clone();
        let id = self.alloc_id();
        self.turns.push(Turn::streaming_placeholder(id));
        self.in_flight = Some(id);
        (id, snapshot)
    }

    /// append the user turn and the assistant turn carrying the image url.
    pub fn push_image(&mut self, user_text: impl Into<String>, prompt: &str, url: String) -> TurnId {
        self.push_turn(Role::User, user_text);
        let id = self.alloc_id();
        self.turns.push(Turn::new(id, Role::Assistant, format!("Generated: {prompt}")).with_image(url));
        id
    }

    /// append a fragment; ignored once the turn has stopped streaming.
    pub fn apply_delta(&mut self, id: TurnId, text: &str) -> bool {
        match self.turn_mut(id) {
            Some(turn) if turn.is_streaming => {
                turn.content.push_str(text);
                true
            }
            _ => false,
        }
    }

    /// clear the streaming flag; returns the final text the first time only.
    pub fn finish_stream(&mut self, id: TurnId) -> Option<String> {
        self.settle(id, None)
    }

    /// replace the text with `ERROR_TEXT` and clear the streaming flag.
    pub fn fail_stream(&mut self, id: TurnId) -> bool {
        self.settle(id, Some(ERROR_TEXT)).is_some()
    }

    fn settle(&mut self, id: TurnId, replace: Option<&str>) -> Option<String> {
        if self.in_flight == Some(id) {
            self.in_flight = None;
        }
        let turn = self.turn_mut(id).filter(|t| t.is_streaming)?;
        turn.is_streaming = false;
        if let Some(text) = replace {
            turn.content = text.to_string();
        }
        Some(turn.content.clone())
    }
}

/// insert this component to submit a line of user input for the session entity.
#[derive(Component, Clone, Debug)]
pub struct ChatRequest {
    pub text: String,
}

/// helper to enqueue a line of user input on a session entity.
pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_chat_stream", "send_user_text -> '{}' (len={})", text, text.len());
    commands.entity(target).insert(ChatRequest { text });
}

/// events emitted by the plugin during/after a submission.
#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
    pub turn: TurnId,
}
#[derive(Event, Debug)]
pub struct ChatDeltaEvt {
    pub entity: Entity,
    pub turn: TurnId,
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    pub turn: TurnId,
    /// the full assistant text of the turn.
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub turn: TurnId,
    pub error: String,
}
#[derive(Event, Debug)]
pub struct ChatImageEvt {
    pub entity: Entity,
    pub turn: TurnId,
    pub url: String,
}
/// a submission arrived while the session was still streaming; it was dropped.
#[derive(Event, Debug)]
pub struct ChatRejectedEvt {
    pub entity: Entity,
    pub text: String,
}

const INBOX_CAPACITY: usize = 2048;

/// cross-thread inbox for streaming; producers send, main thread drains.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = inbox_channel();
        Self { tx, rx }
    }
}

// native workers sit on tokio's blocking pool, so a full inbox only parks the
// worker until the next drain.
#[cfg(not(target_arch = "wasm32"))]
fn inbox_channel() -> (Sender<StreamMsg>, Receiver<StreamMsg>) {
    flume::bounded(INBOX_CAPACITY)
}

// on wasm the stream task shares the only thread with the drain system; a
// blocking send on a full inbox would never be released.
#[cfg(target_arch = "wasm32")]
fn inbox_channel() -> (Sender<StreamMsg>, Receiver<StreamMsg>) {
    flume::unbounded()
}

#[derive(Debug)]
enum StreamMsg {
    Delta { entity: Entity, turn: TurnId, text: String },
    Done  { entity: Entity, turn: TurnId },
    Err   { entity: Entity, turn: TurnId, error: String },
}

impl StreamMsg {
    fn entity(&self) -> Entity {
        match self {
            Self::Delta { entity, .. } | Self::Done { entity, .. } | Self::Err { entity, .. } => *entity,
        }
    }
}

/// send to inbox (ignore disconnected)
fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send(msg);
}

/// stream client callbacks that forward into the inbox for one assistant turn.
fn inbox_callbacks(
    tx: Sender<StreamMsg>,
    entity: Entity,
    turn: TurnId,
) -> (impl FnMut(&str), impl FnOnce(), impl FnOnce(StreamError)) {
    let delta_tx = tx.clone();
    let err_tx = tx.clone();
    (
        move |text: &str| push_inbox(&delta_tx, StreamMsg::Delta { entity, turn, text: text.to_string() }),
        move || push_inbox(&tx, StreamMsg::Done { entity, turn }),
        move |err: StreamError| push_inbox(&err_tx, StreamMsg::Err { entity, turn, error: err.to_string() }),
    )
}

/// bevy plugin: wires systems, events, resources.
/// inserts a `StreamClient` built from `ChatConfig::from_env()` unless one is
/// already present. on native, also inserts a tiny tokio runtime resource.
pub struct ChatStreamPlugin;

impl Plugin for ChatStreamPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_chat_stream", "ChatStreamPlugin: build()");
        app.init_resource::<StreamInbox>()
            .add_event::<ChatStarted>()
            .add_event::<ChatDeltaEvt>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            .add_event::<ChatImageEvt>()
            .add_event::<ChatRejectedEvt>()
            // write + read events in the same schedule (Update)
            .configure_sets(Update, ChatSet::Drain)
            .add_systems(Update, drain_stream_inbox.in_set(ChatSet::Drain))
            .add_systems(Update, spawn_chat_requests.before(ChatSet::Drain));

        if app.world().get_resource::<StreamClient>().is_none() {
            app.insert_resource(StreamClient::new(ChatConfig::from_env()));
        }

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// routes pending requests: image urls inline, text onto a stream worker.
fn spawn_chat_requests(
    mut commands: Commands,
    client: Res<StreamClient>,
    inbox: Res<StreamInbox>,
    mut q: Query<(Entity, &mut ChatSession, &ChatRequest)>,
    mut ev_start: EventWriter<ChatStarted>,
    mut ev_image: EventWriter<ChatImageEvt>,
    mut ev_reject: EventWriter<ChatRejectedEvt>,

    // native-only: small runtime hosting the blocking reads
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for (e, mut session, req) in q.iter_mut() {
        // one-shot marker removal
        commands.entity(e).remove::<ChatRequest>();

        let Some(submission) = Submission::parse(&req.text) else {
            debug!(target: "bevy_chat_stream", "entity={:?} empty submission ignored", e);
            continue;
        };

        if session.is_busy() {
            warn!(target: "bevy_chat_stream", "entity={:?} still streaming; dropping submission", e);
            ev_reject.write(ChatRejectedEvt { entity: e, text: req.text.clone() });
            continue;
        }

        let text = match submission {
            Submission::Image(prompt) => {
                let url = client.config().image.build_url(&prompt, None);
                info!(target: "bevy_chat_stream", "image request: entity={:?} url={}", e, url);
                let turn = session.push_image(req.text.trim(), &prompt, url.clone());
                ev_image.write(ChatImageEvt { entity: e, turn, url });
                continue;
            }
            Submission::Text(text) => text,
        };

        let (turn, snapshot) = session.begin_text(text);
        info!(target: "bevy_chat_stream",
            "spawn_chat_requests: entity={:?} turn={:?} msgs={}",
            e, turn, snapshot.len()
        );
        ev_start.write(ChatStarted { entity: e, turn });

        let client = client.clone();
        let (on_fragment, on_complete, on_failure) = inbox_callbacks(inbox.tx.clone(), e, turn);

        #[cfg(not(target_arch = "wasm32"))]
        {
            // native: ureq blocks, so hand it to tokio's blocking pool.
            drop(rt.0.spawn_blocking(move || {
                client.stream_completion(&snapshot, on_fragment, on_complete, on_failure);
            }));
        }
        #[cfg(target_arch = "wasm32")]
        {
            // wasm path: just await directly on bevy's async pool.
            bevy::tasks::AsyncComputeTaskPool::get()
                .spawn(async move {
                    client.stream_completion(&snapshot, on_fragment, on_complete, on_failure).await;
                })
                .detach();
        }
    }
}

/// drains the inbox, applies it to the session turns, emits user-facing events.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    mut sessions: Query<&mut ChatSession>,
    mut ev_delta: EventWriter<ChatDeltaEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    for _ in 0..MAX_PER_FRAME {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        };
        let Ok(mut session) = sessions.get_mut(msg.entity()) else {
            debug!(target: "bevy_chat_stream", "session gone; dropping {:?}", msg);
            continue;
        };
        match msg {
            StreamMsg::Delta { entity, turn, text } => {
                if session.apply_delta(turn, &text) {
                    ev_delta.write(ChatDeltaEvt { entity, turn, text });
                }
            }
            StreamMsg::Done { entity, turn } => {
                if let Some(text) = session.finish_stream(turn) {
                    info!(target: "bevy_chat_stream", "stream completed: entity={:?} final_len={}", entity, text.len());
                    ev_done.write(ChatCompletedEvt { entity, turn, text });
                }
            }
            StreamMsg::Err { entity, turn, error } => {
                error!(target: "bevy_chat_stream", "chat error: entity={:?} {}", entity, error);
                if session.fail_stream(turn) {
                    ev_err.write(ChatErrorEvt { entity, turn, error });
                }
            }
        }
    }
}
