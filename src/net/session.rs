//! Authenticated session loop.
//!
//! Each connection authenticates with an AUTH frame (version-gated), then
//! loops reading framed command lines. Privileged-sigil commands route to
//! the admin table when the issuer holds `admin`; plain commands route to
//! the user table when the issuer holds `user`; everything else is denied.
//! Transport failures end the session quietly; handler failures reply EXC
//! and keep the session alive.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::command::parser::CommandParser;
use crate::command::{CommandTable, ServerCommand};
use crate::net::framing::{read_frame, write_frame};
use crate::net::message::{AuthMode, Message, PROTOCOL_VERSION};
use crate::AppState;

/// The privileged-command sigil on the server side.
const PRIVILEGED_SIGIL: char = '*';

pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "incoming connection");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    handle_connection(stream, state).await;
                });
            }
            Err(e) => {
                error!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>) {
    let (mut reader, mut writer) = stream.into_split();
    run_session(&mut reader, &mut writer, state).await;
}

/// Generic over the transport so the loop can be driven by in-memory pipes.
pub async fn run_session<R, W>(reader: &mut R, writer: &mut W, state: Arc<AppState>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(user) = authenticate(reader, writer, &state).await else {
        return;
    };
    state.tree().add_user(&user, 0.0);
    info!(user = %user, "session established");

    loop {
        let raw = match read_frame(reader).await {
            Ok(raw) => raw,
            Err(e) if e.is_disconnect() => {
                info!(user = %user, "disconnected");
                return;
            }
            Err(e) => {
                warn!(user = %user, "transport error: {}", e);
                return;
            }
        };

        // The principal may have been renamed or removed mid-session.
        if !matches!(state.accounts.exists(&user).await, Ok(true)) {
            info!(user = %user, "principal no longer exists, closing session");
            return;
        }

        let reply = process_command(&state, &user, &raw).await;
        if let Err(e) = write_frame(writer, &reply.encode()).await {
            if e.is_disconnect() {
                info!(user = %user, "disconnected");
            } else {
                warn!(user = %user, "reply failed: {}", e);
            }
            return;
        }
    }
}

pub async fn process_command(state: &Arc<AppState>, user: &str, raw: &str) -> Message {
    let parsed = match CommandParser::new(PRIVILEGED_SIGIL).parse(raw) {
        Ok(parsed) => parsed,
        Err(e) => return Message::exc(e.to_string_frame()),
    };
    let command = ServerCommand::new(parsed, user);

    if command.local {
        match state.accounts.has_role(user, "admin").await {
            Ok(true) => {
                info!(user, command = %command.raw, "privileged command");
                return dispatch(state, &state.admin_commands, command).await;
            }
            Ok(false) => {}
            Err(e) => return Message::exc(e.to_string()),
        }
    } else {
        match state.accounts.has_role(user, "user").await {
            Ok(true) => return dispatch(state, &state.user_commands, command).await,
            Ok(false) => {}
            Err(e) => return Message::exc(e.to_string()),
        }
    }

    warn!(user, command = %command.raw, "unauthorized command");
    Message::deny("Permission denied")
}

async fn dispatch(state: &Arc<AppState>, table: &CommandTable, command: ServerCommand) -> Message {
    let name = command.name.clone();
    let issuer = command.issuer.clone();
    match table.dispatch(state, command) {
        Ok(future) => match future.await {
            Ok(message) => message,
            Err(e) => {
                error!(user = %issuer, command = %name, "handler failed: {:#}", e);
                Message::exc(e.to_string())
            }
        },
        Err(e) => {
            info!(user = %issuer, command = %name, "invalid command: {}", e);
            Message::exc(e.to_string())
        }
    }
}

async fn authenticate<R, W>(reader: &mut R, writer: &mut W, state: &Arc<AppState>) -> Option<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let raw = read_frame(reader).await.ok()?;
    let Ok(Message::Auth {
        version,
        mode,
        name,
        email,
        password,
    }) = Message::decode(&raw)
    else {
        let _ = write_frame(writer, &Message::bad("Expected AUTH message").encode()).await;
        return None;
    };

    if version != PROTOCOL_VERSION {
        let _ = write_frame(writer, &Message::version_mismatch().encode()).await;
        return None;
    }

    let outcome = match mode {
        AuthMode::Login => login(state, &name, &password).await,
        AuthMode::Signup => signup(state, &name, &email, &password).await,
    };

    match outcome {
        Ok(Ok(())) => {
            let _ = write_frame(writer, &Message::done("Login successful").encode()).await;
            Some(name)
        }
        Ok(Err(refusal)) => {
            let _ = write_frame(writer, &Message::bad(refusal).encode()).await;
            None
        }
        Err(e) => {
            error!("authentication failed: {}", e);
            let _ = write_frame(writer, &Message::exc(e.to_string()).encode()).await;
            None
        }
    }
}

async fn login(
    state: &Arc<AppState>,
    name: &str,
    password: &str,
) -> Result<Result<(), String>, sqlx::Error> {
    if state.accounts.verify(name, password).await? {
        Ok(Ok(()))
    } else {
        Ok(Err("No such user".to_string()))
    }
}

async fn signup(
    state: &Arc<AppState>,
    name: &str,
    email: &str,
    password: &str,
) -> Result<Result<(), String>, sqlx::Error> {
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Ok(Err("Username contains invalid characters".to_string()));
    }
    if !state.accounts.add_user(name, Some(email), password).await? {
        return Ok(Err("User already exists".to_string()));
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{StatusCode, StatusMode};
    use serde_json::Value;

    async fn test_state() -> Arc<AppState> {
        let state = crate::test_support::state().await;
        state.tree().add_asset("XYZ", "EQ", "admin");
        state.market.create_market("XYZ");
        for name in ["A", "B", "C"] {
            state.accounts.add_user(name, None, "pw").await.unwrap();
            state.tree().add_user(name, 1000.0);
        }
        state
    }

    fn status_parts(message: &Message) -> (StatusMode, StatusCode, Value) {
        match message {
            Message::Status {
                mode,
                code,
                message,
            } => (*mode, *code, message.clone()),
            other => panic!("expected STATUS, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_book_limit_buy() {
        let state = test_state().await;
        let reply = process_command(&state, "A", "buylimit XYZ 10 100").await;
        let (mode, code, message) = status_parts(&reply);
        assert_eq!(mode, StatusMode::Ok);
        assert_eq!(code, StatusCode::Done);
        assert_eq!(message["filled"], 0);
        assert_eq!(message["price"], 0.0);
        assert!(message["id"].as_u64().is_some());

        let asset = state.tree().asset("XYZ").unwrap();
        asset.with(|a| {
            assert_eq!(a.immediate.bid, Some(100.0));
            assert_eq!(a.immediate.bid_volume, Some(10));
            assert_eq!(a.immediate.depth.bids.get("100"), Some(&10));
            assert_eq!(a.immediate.ask, None);
            assert_eq!(a.immediate.ask_volume, None);
        });
    }

    #[tokio::test]
    async fn test_crossing_limit_sell() {
        let state = test_state().await;
        process_command(&state, "A", "buylimit XYZ 10 100").await;
        let reply = process_command(&state, "B", "selllimit XYZ 4 99").await;
        let (_, code, message) = status_parts(&reply);
        assert_eq!(code, StatusCode::Done);
        assert_eq!(message["filled"], 4);
        assert_eq!(message["price"], 100.0);

        let a = state.tree().user("A").unwrap();
        a.with(|u| {
            assert_eq!(u.current.assets.get("XYZ"), Some(&4));
            assert_eq!(u.current.balance, -400.0);
        });
        let b = state.tree().user("B").unwrap();
        b.with(|u| {
            assert_eq!(u.current.assets.get("XYZ"), Some(&-4));
            assert_eq!(u.current.balance, 400.0);
        });
        let asset = state.tree().asset("XYZ").unwrap();
        asset.with(|a| {
            assert_eq!(a.immediate.bid, Some(100.0));
            assert_eq!(a.immediate.bid_volume, Some(6));
            assert_eq!(a.immediate.depth.bids.get("100"), Some(&6));
        });
    }

    #[tokio::test]
    async fn test_cancel_by_non_owner_denied() {
        let state = test_state().await;
        let reply = process_command(&state, "A", "buylimit XYZ 10 100").await;
        let (_, _, message) = status_parts(&reply);
        let order_id = message["id"].as_u64().unwrap();

        let reply = process_command(&state, "C", &format!("deleteorder {}", order_id)).await;
        let (mode, code, message) = status_parts(&reply);
        assert_eq!(mode, StatusMode::Err);
        assert_eq!(code, StatusCode::Deny);
        assert_eq!(message["errno"], -2);
    }

    #[tokio::test]
    async fn test_unknown_ticker_is_bad() {
        let state = test_state().await;
        let reply = process_command(&state, "A", "buymarket ZZZ 1").await;
        let (mode, code, message) = status_parts(&reply);
        assert_eq!(mode, StatusMode::Err);
        assert_eq!(code, StatusCode::Bad);
        assert!(message["content"]
            .as_str()
            .unwrap()
            .contains("No such ticker 'ZZZ'"));
    }

    #[tokio::test]
    async fn test_privileged_command_requires_admin_role() {
        let state = test_state().await;
        let reply = process_command(&state, "A", "*setbal A 5000").await;
        let (mode, code, _) = status_parts(&reply);
        assert_eq!(mode, StatusMode::Err);
        assert_eq!(code, StatusCode::Deny);

        let reply = process_command(&state, "admin", "*setbal A 5000").await;
        let (_, code, _) = status_parts(&reply);
        assert_eq!(code, StatusCode::Done);
        let a = state.tree().user("A").unwrap();
        assert_eq!(a.with(|u| u.settled.balance), 5000.0);
    }

    #[tokio::test]
    async fn test_unknown_command_is_exc() {
        let state = test_state().await;
        let reply = process_command(&state, "A", "frobnicate").await;
        let (mode, code, message) = status_parts(&reply);
        assert_eq!(mode, StatusMode::Err);
        assert_eq!(code, StatusCode::Exc);
        assert!(message["content"].as_str().unwrap().contains("frobnicate"));
    }

    #[tokio::test]
    async fn test_bad_arity_is_exc() {
        let state = test_state().await;
        let reply = process_command(&state, "A", "pay B").await;
        let (_, code, message) = status_parts(&reply);
        assert_eq!(code, StatusCode::Exc);
        assert!(message["content"].as_str().unwrap().contains("2"));
    }

    #[tokio::test]
    async fn test_malformed_command_reports_offset() {
        let state = test_state().await;
        let reply = process_command(&state, "A", "pay @B 5").await;
        let (_, code, message) = status_parts(&reply);
        assert_eq!(code, StatusCode::Exc);
        assert!(message["content"].as_str().unwrap().contains('^'));
    }

    #[tokio::test]
    async fn test_auth_version_gate_over_pipe() {
        let state = test_state().await;
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let session = tokio::spawn(async move {
            run_session(&mut server_read, &mut server_write, state).await;
        });

        let auth = Message::Auth {
            version: "0.0.1".into(),
            mode: AuthMode::Login,
            name: "A".into(),
            email: String::new(),
            password: "pw".into(),
        };
        write_frame(&mut client_write, &auth.encode()).await.unwrap();
        let reply = Message::decode(&read_frame(&mut client_read).await.unwrap()).unwrap();
        let (mode, code, _) = status_parts(&reply);
        assert_eq!(mode, StatusMode::Err);
        assert_eq!(code, StatusCode::Ver);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_signup_login_command_roundtrip_over_pipe() {
        let state = test_state().await;
        let (client, server) = tokio::io::duplex(16384);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let session_state = Arc::clone(&state);
        let session = tokio::spawn(async move {
            run_session(&mut server_read, &mut server_write, session_state).await;
        });

        let auth = Message::Auth {
            version: PROTOCOL_VERSION.into(),
            mode: AuthMode::Signup,
            name: "dora".into(),
            email: "d@example.com".into(),
            password: "pw".into(),
        };
        write_frame(&mut client_write, &auth.encode()).await.unwrap();
        let reply = Message::decode(&read_frame(&mut client_read).await.unwrap()).unwrap();
        let (mode, code, _) = status_parts(&reply);
        assert_eq!(mode, StatusMode::Ok);
        assert_eq!(code, StatusCode::Done);

        write_frame(&mut client_write, "whoami").await.unwrap();
        let reply = Message::decode(&read_frame(&mut client_read).await.unwrap()).unwrap();
        match reply {
            Message::Value { value, .. } => assert_eq!(value, serde_json::json!("dora")),
            other => panic!("expected VALUE, got {:?}", other),
        }

        // Both halves must go away for the pipe to close and the session
        // loop to observe EOF.
        drop(client_write);
        drop(client_read);
        session.await.unwrap();
        assert!(state.tree().user("dora").is_some());
    }
}
