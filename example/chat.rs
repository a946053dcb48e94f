//! minimal bevy + bevy_chat_stream example.
//! - type and press enter to stream a reply; `/image <prompt>` adds an image url turn.
//! - the whole turn list is re-rendered whenever the session changes.
//! - a second send while a reply is still streaming is rejected by the plugin.
//!
//! env:
//!   API_KEY   (bearer credential, optional)

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_chat_stream::{
    ChatErrorEvt, ChatImageEvt, ChatRejectedEvt, ChatSession, ChatSet, ChatStreamPlugin, Role,
    send_user_text,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct StatusText;

#[derive(Component, Copy, Clone)]
struct TargetSession(Entity);

#[derive(Resource, Default)]
struct PromptBuf(String);

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(255, 255, 255)))
        .insert_resource(PromptBuf::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(ChatStreamPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, refresh_prompt_text))
        // event readers should run after bevy_chat_stream emits events
        .add_systems(
            Update,
            (refresh_history, on_image, on_error, on_rejected).after(ChatSet::Drain),
        )
        .run();
}

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d::default());

    let session = commands.spawn(ChatSession::with_greeting()).id();

    let body = TextFont { font_size: 18.0, ..default() };
    let small = TextFont { font_size: 14.0, ..default() };
    let ink = TextColor(Color::srgb_u8(17, 24, 39));

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(16.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    overflow: Overflow::clip(),
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|c| {
                c.spawn((Text::new(""), body.clone(), ink.clone(), HistoryText, TargetSession(session)));
            });
            p.spawn((Text::new(""), small.clone(), TextColor(Color::srgb_u8(156, 163, 175)), StatusText));
            p.spawn((Text::new("> "), body.clone(), ink.clone(), PromptText, TargetSession(session)));
        });
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    q_prompt_target: Query<&TargetSession, With<PromptText>>,
) {
    for ev in ev_kbd.read() {
        if ev.state.is_pressed() {
            if let Some(txt) = &ev.text {
                let s = txt.replace(['\r', '\n'], "");
                prompt.0.push_str(&s);
            }
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    // enter sends; shift+enter is ignored (single-line prompt)
    let shift = keys.any_pressed([KeyCode::ShiftLeft, KeyCode::ShiftRight]);
    if keys.just_pressed(KeyCode::Enter) && !shift {
        if let Ok(TargetSession(e)) = q_prompt_target.single() {
            if !prompt.0.trim().is_empty() {
                let msg = std::mem::take(&mut prompt.0);
                info!(target: "chat_demo", "send -> '{}' (len={})", msg, msg.len());
                send_user_text(&mut commands, *e, msg);
            }
        }
    }
}

// ---------------------- text refresh ----------------------

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q_prompt: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed() {
        if let Ok(mut t) = q_prompt.single_mut() {
            t.0 = format!("> {} |", prompt.0);
        }
    }
}

fn refresh_history(
    q_sessions: Query<(Entity, &ChatSession), Changed<ChatSession>>,
    mut q_hist: Query<(&TargetSession, &mut Text), With<HistoryText>>,
) {
    for (entity, session) in &q_sessions {
        let mut out = String::new();
        for turn in session.turns() {
            let who = match turn.role {
                Role::User => "you",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            out.push_str(who);
            out.push_str(": ");
            out.push_str(&turn.content);
            if turn.is_streaming {
                out.push_str(" _");
            }
            if let Some(url) = &turn.image_url {
                out.push_str("\n  [image] ");
                out.push_str(url);
            }
            out.push_str("\n\n");
        }
        for (TargetSession(t), mut h) in q_hist.iter_mut() {
            if *t == entity {
                h.0 = out.clone();
            }
        }
    }
}

// ---------------------- chat events ----------------------

fn on_image(mut ev: EventReader<ChatImageEvt>, mut q: Query<&mut Text, With<StatusText>>) {
    for ChatImageEvt { url, .. } in ev.read() {
        info!(target: "chat_demo", "image url ready: {}", url);
        if let Ok(mut t) = q.single_mut() {
            t.0 = "image url added (open it in a browser)".to_string();
        }
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>, mut q: Query<&mut Text, With<StatusText>>) {
    for ChatErrorEvt { entity, error, .. } in ev.read() {
        error!(target: "chat_demo", "chat error (entity={:?}): {}", entity, error);
        if let Ok(mut t) = q.single_mut() {
            t.0 = format!("ERROR: {}", error);
        }
    }
}

fn on_rejected(mut ev: EventReader<ChatRejectedEvt>, mut q: Query<&mut Text, With<StatusText>>) {
    for ChatRejectedEvt { text, .. } in ev.read() {
        warn!(target: "chat_demo", "still streaming; dropped '{}'", text);
        if let Ok(mut t) = q.single_mut() {
            t.0 = "still answering; wait for the reply to finish".to_string();
        }
    }
}
