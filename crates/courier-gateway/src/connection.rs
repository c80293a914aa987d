use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use courier_crypto::{Keypair, PublicKey, SecretKey};
use courier_db::{session, Database};
use courier_types::events::{ClientCommand, ServerEvent};

use crate::presence::PresenceDirectory;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Negotiated per-connection channel keys. Generated on `secure_req`,
/// never persisted; the keys die with the connection.
struct ChannelCrypto {
    secret: SecretKey,
    peer: PublicKey,
}

type SharedCrypto = Arc<std::sync::RwLock<Option<ChannelCrypto>>>;

/// Handle one WebSocket connection for its entire lifetime.
///
/// A connection starts unauthenticated and in plaintext mode. `secure_req`
/// upgrades it to sealed mode; `auth_res` binds it to a user (and
/// optionally a device) in the presence directory. Both upgrades are
/// one-way — a connection that never secures stays plaintext for good.
pub async fn handle_connection(socket: WebSocket, db: Arc<Database>, presence: PresenceDirectory) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    info!("connection {} opened", conn_id);

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let crypto: SharedCrypto = Arc::new(std::sync::RwLock::new(None));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // All outbound traffic funnels through one task so sealing happens in
    // exactly one place, with whatever channel keys are current.
    let crypto_send = crypto.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = rx.recv() => {
                    let Some(event) = result else { break };
                    let text = {
                        let guard = crypto_send.read().expect("channel crypto lock poisoned");
                        encode_event(&event, guard.as_ref())
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("connection {} heartbeat timeout, dropping", conn_id);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let crypto_recv = crypto.clone();
    let presence_recv = presence.clone();
    let tx_recv = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut authenticated: Option<i64> = None;

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let command = {
                        let guard = crypto_recv.read().expect("channel crypto lock poisoned");
                        decode_command(&text, guard.as_ref())
                    };
                    let command = match command {
                        Ok(command) => command,
                        Err(e) => {
                            // A packet that cannot be decoded or unsealed is
                            // dropped; it must never reach handlers as
                            // poisoned data.
                            warn!("connection {} dropped bad packet: {}", conn_id, e);
                            continue;
                        }
                    };
                    handle_command(
                        command,
                        conn_id,
                        &db,
                        &presence_recv,
                        &crypto_recv,
                        &tx_recv,
                        &mut authenticated,
                    )
                    .await;
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    presence.unregister(conn_id).await;
    info!("connection {} closed", conn_id);
}

async fn handle_command(
    command: ClientCommand,
    conn_id: Uuid,
    db: &Arc<Database>,
    presence: &PresenceDirectory,
    crypto: &SharedCrypto,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    authenticated: &mut Option<i64>,
) {
    match command {
        ClientCommand::SecureReq { public_key } => {
            let peer = match PublicKey::from_hex(&public_key) {
                Ok(peer) => peer,
                Err(e) => {
                    // Connection stays in plaintext mode.
                    warn!("connection {} sent unusable secure_req key: {}", conn_id, e);
                    return;
                }
            };
            let pair = Keypair::generate();
            let server_public = pair.public.to_hex();
            {
                let mut guard = crypto.write().expect("channel crypto lock poisoned");
                *guard = Some(ChannelCrypto { secret: pair.secret, peer });
            }
            // secure_res itself goes out plaintext: the client cannot open
            // a box sealed to a key it has not received yet.
            let _ = tx.send(ServerEvent::SecureRes { public_key: server_public });
            info!("connection {} switched to sealed mode", conn_id);
        }

        ClientCommand::AuthRes { token, device_id } => {
            if authenticated.is_some() {
                warn!("connection {} re-sent auth_res, ignoring", conn_id);
                return;
            }
            let db = db.clone();
            let now_ms = chrono::Utc::now().timestamp_millis();
            let verified = tokio::task::spawn_blocking(move || {
                session::verify_token(&db, &token, now_ms)
            })
            .await;

            match verified {
                Ok(Ok(Some(verified))) => {
                    presence
                        .register(verified.user_id, conn_id, tx.clone(), device_id)
                        .await;
                    *authenticated = Some(verified.user_id);
                    info!(
                        "connection {} authenticated as user {} (device {:?})",
                        conn_id, verified.user_id, device_id
                    );
                }
                Ok(Ok(None)) => {
                    let _ = tx.send(ServerEvent::AuthStatus { status: "rejected".into() });
                }
                Ok(Err(e)) => {
                    error!("connection {} auth lookup failed: {}", conn_id, e);
                }
                Err(e) => {
                    error!("connection {} auth task panicked: {}", conn_id, e);
                }
            }
        }
    }
}

/// Serialize an outbound event, sealing the data payload when the channel
/// is in sealed mode. `secure_res` is the one exception: it carries the
/// key the client needs before it can open anything.
fn encode_event(event: &ServerEvent, crypto: Option<&ChannelCrypto>) -> String {
    let mut value = serde_json::to_value(event).unwrap();
    if let Some(crypto) = crypto {
        if value["type"] != "secure_res" {
            let plain = serde_json::to_vec(&value["data"]).unwrap();
            value["data"] = Value::String(courier_crypto::seal_hex(&crypto.peer, &plain));
        }
    }
    value.to_string()
}

/// Parse an inbound frame, unsealing the data payload first when the
/// channel is in sealed mode.
fn decode_command(text: &str, crypto: Option<&ChannelCrypto>) -> anyhow::Result<ClientCommand> {
    let mut value: Value = serde_json::from_str(text)?;
    if let Some(crypto) = crypto {
        let sealed = value
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("sealed channel requires a hex data payload"))?;
        let plain = courier_crypto::open_hex(&crypto.secret, sealed)?;
        value["data"] = serde_json::from_slice(&plain)?;
    }
    Ok(serde_json::from_value(value)?)
}
