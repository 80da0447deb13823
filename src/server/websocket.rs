use crate::agent::TravelAgent;
use crate::cli::Args;
use crate::history::PersistenceAdapter;
use crate::llm::gemini::GeminiSession;
use crate::llm::GeminiConfig;
use crate::models::websocket::{ ClientMessage, ServerMessage };

use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use lazy_static::lazy_static;
use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use futures::{ SinkExt, StreamExt };
use log::{ error, info, warn };

type HmacSha256 = Hmac<Sha256>;

const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024; // data-URI images are large

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let key = match pkcs8_private_keys(&mut BufReader::new(key_file)).next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

/// Timestamped HMAC check over the handshake query string: `ts` within
/// five minutes and `sig` = hex(HMAC-SHA256(secret, ts)).
fn verify_query_signature(secret: &str, query: &str) -> Result<(), &'static str> {
    let params: HashMap<String, String> = form_urlencoded
        ::parse(query.as_bytes())
        .into_owned()
        .collect();

    let ts = params
        .get("ts")
        .or_else(|| params.get("X-Api-Ts"))
        .ok_or("missing ts/sig")?;
    let sig = params
        .get("sig")
        .or_else(|| params.get("X-Api-Sign"))
        .ok_or("missing ts/sig")?;

    let ts_i: i64 = ts.parse().unwrap_or(0);
    if (Utc::now().timestamp() - ts_i).abs() > 300 {
        return Err("timestamp out of range");
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "bad secret")?;
    mac.update(ts.as_bytes());
    if hex::encode(mac.finalize().into_bytes()) == *sig {
        Ok(())
    } else {
        Err("bad signature")
    }
}

pub async fn start_ws_server(
    addr: &str,
    adapter: Arc<dyn PersistenceAdapter>,
    api_key: Option<String>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                Some(TlsAcceptor::from(load_tls_config(cert_path, key_path)?))
            }
            _ => {
                error!("--enable-tls requires both --tls-cert-path and --tls-key-path.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        None
    };

    let protocol = if tls_acceptor.is_some() { "WSS" } else { "WS" };
    info!("{} server listening on: {}", protocol, addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let adapter = Arc::clone(&adapter);
        let required_api_key = api_key.clone();
        let tls_acceptor = tls_acceptor.clone();
        let args = args.clone();

        tokio::spawn(async move {
            let result = if let Some(acceptor) = tls_acceptor {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) =>
                        process_connection(peer, tls_stream, adapter, required_api_key, args).await,
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, adapter, required_api_key, args).await
            };

            if let Err(e) = result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    adapter: Arc<dyn PersistenceAdapter>,
    required_api_key: Option<String>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Ok(response);
            }
        };

        match verify_query_signature(secret, req.uri().query().unwrap_or("")) {
            Ok(()) => Ok(response),
            Err(reason) => {
                warn!("Rejected handshake from {}: {}", peer, reason);
                let res = Response::builder()
                    .status(401)
                    .body(Some(reason.into()))
                    .unwrap();
                Err(ErrorResponse::from(res))
            }
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, adapter, args).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    adapter: Arc<dyn PersistenceAdapter>,
    args: Args
)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    info!("New WebSocket connection: {}", peer);

    let (mut ws_tx, mut ws_rx) = websocket.split();

    // Agent progress (partials, resolutions) and control frames (pongs)
    // both funnel into one writer task so streaming output reaches the
    // client while the read loop is awaiting the agent.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            let json = match serde_json::to_string(&event) {
                                Ok(json) => json,
                                Err(e) => {
                                    error!("Failed to encode server frame: {}", e);
                                    continue;
                                }
                            };
                            if ws_tx.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                frame = control_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let model = GeminiSession::new(
        GeminiConfig::new(
            args.gemini_api_key.clone(),
            args.gemini_model.clone(),
            args.gemini_base_url.clone()
        )
    );
    let mut agent = TravelAgent::new(adapter, Box::new(model), events_tx.clone());

    // Every connection starts as a guest conversation; a richer client
    // could add sign-in frames on top of the same agent.
    if let Err(e) = agent.sign_in_as_guest().await {
        warn!("Guest sign-in failed for {}: {}", peer, e);
    }

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        text.len(),
                        MAX_MESSAGE_SIZE
                    );
                    let _ = events_tx.send(ServerMessage::Error {
                        message: "Message too large".to_string(),
                    });
                    break;
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(frame) => {
                        if let Err(e) = dispatch(&mut agent, frame).await {
                            error!("Request from {} failed: {}", peer, e);
                            let _ = events_tx.send(ServerMessage::Error {
                                message: e.to_string(),
                            });
                        }
                    }
                    Err(e) => {
                        error!("Failed to parse message from {}: {}", peer, e);
                        let _ = events_tx.send(ServerMessage::Error {
                            message: format!("Failed to parse message: {}", e),
                        });
                    }
                }
            }
            Ok(Message::Ping(ping_data)) => {
                if control_tx.send(Message::Pong(ping_data)).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("Received close frame from {}", peer);
                break;
            }
            Ok(Message::Pong(_)) => {/* Usually ignore pongs */}
            Ok(Message::Binary(_)) => {
                warn!("Ignoring binary message from {}", peer);
            }
            Ok(Message::Frame(_)) => {/* Usually ignore raw frames */}
            Err(e) => {
                match e {
                    | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                        io_err.kind() == std::io::ErrorKind::ConnectionReset
                    => {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        }
    }

    // Navigating away abandons the conversation; there is no durable state
    // to flush beyond what the send path already wrote.
    drop(agent);
    drop(events_tx);
    drop(control_tx);
    let _ = writer.await;
    info!("WebSocket connection closed for {}", peer);
}

async fn dispatch(
    agent: &mut TravelAgent,
    frame: ClientMessage
) -> Result<(), crate::agent::ChatError> {
    match frame {
        ClientMessage::Chat { content, image } => agent.send_message(&content, image).await,
        ClientMessage::Regenerate { message_id } => agent.regenerate(&message_id).await,
        ClientMessage::SelectSession { session_id } => agent.select_session(&session_id).await,
        ClientMessage::NewChat => agent.new_chat(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn fresh_signature_is_accepted() {
        let ts = Utc::now().timestamp();
        let query = format!("ts={}&sig={}", ts, sign("secret", ts));
        assert!(verify_query_signature("secret", &query).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let ts = Utc::now().timestamp() - 3600;
        let query = format!("ts={}&sig={}", ts, sign("secret", ts));
        assert_eq!(
            verify_query_signature("secret", &query),
            Err("timestamp out of range")
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let ts = Utc::now().timestamp();
        let query = format!("ts={}&sig={}", ts, sign("other", ts));
        assert_eq!(verify_query_signature("secret", &query), Err("bad signature"));
    }

    #[test]
    fn missing_params_are_rejected() {
        assert_eq!(verify_query_signature("secret", ""), Err("missing ts/sig"));
    }
}
