//! Connection manager: keeps one healthy publish subscription per
//! controller and services the request channel for returns.
//!
//! The lifecycle is an explicit state machine over
//! [`ConnState`]; reconnect and failover decisions are driven by the
//! `__master_disconnected` / `__master_connected` events in the
//! supervisor.

use crate::config::AgentConfig;
use outrider_protocol::envelope::{SignInAck, SignInPayload};
use outrider_protocol::error::{AgentError, ProtocolError};
use outrider_protocol::{jid, Frame, OpCode};
use outrider_registry::{OutboundLoad, OutboundReceiver, OutboundSender};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

/// Connection state of one controller binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Drives sign-in against one controller (or a failover list of them)
/// and owns the binding state.
pub struct ConnectionManager {
    pub cfg: AgentConfig,
    pub state: ConnState,
    /// The original failover list, kept so fixed controllers can be
    /// retried on later rounds.
    master_list: Vec<String>,
    pub current_master: Option<String>,
}

/// A live, signed-in connection: the subscription socket plus the
/// outbound handle into the request task.
pub struct ActiveConnection {
    pub master: String,
    pub master_uri: String,
    pub publish_uri: String,
    pub token: String,
    pub sub: SubSocket,
    pub outbound: OutboundSender,
    req_task: JoinHandle<()>,
}

impl ActiveConnection {
    /// Stop the request task; the sockets close on drop.
    pub fn shutdown(self) {
        self.req_task.abort();
    }
}

impl ConnectionManager {
    pub fn new(cfg: AgentConfig) -> Self {
        let master_list = cfg.master_list();
        Self {
            cfg,
            state: ConnState::Disconnected,
            master_list,
            current_master: None,
        }
    }

    /// Sign in to a controller. In failover mode each candidate is
    /// tried once, with the previously failed controller excluded for
    /// this round; otherwise the single controller is retried
    /// `auth_tries` times with a growing acceptance wait.
    ///
    /// Yields a bound connection or [`AgentError::NoController`].
    pub async fn connect(&mut self, failed: bool) -> Result<ActiveConnection, AgentError> {
        self.state = ConnState::Connecting;

        let candidates = self.candidates(failed);
        if candidates.is_empty() {
            self.state = ConnState::Failed;
            return Err(AgentError::NoController);
        }

        let failover = self.cfg.master_type == "failover";
        for master in candidates {
            let attempt = if failover {
                self.try_master_once(&master).await
            } else {
                self.try_master_with_retries(&master).await
            };
            match attempt {
                Ok(connection) => {
                    self.state = ConnState::Connected;
                    self.current_master = Some(master);
                    return Ok(connection);
                }
                Err(err) => {
                    info!(
                        "Controller {} could not be reached, trying next (if any): {}",
                        master, err
                    );
                }
            }
        }

        self.state = ConnState::Failed;
        error!("No controller could be reached or all denied the connection attempt");
        Err(AgentError::NoController)
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnState::Disconnected;
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnState::Connected;
    }

    fn candidates(&self, failed: bool) -> Vec<String> {
        if self.cfg.master_type == "failover" {
            let mut list = self.master_list.clone();
            if failed {
                if let Some(current) = &self.current_master {
                    info!(
                        "Removing possibly failed controller {} from the candidate list",
                        current
                    );
                    list.retain(|master| master != current);
                }
            }
            if self.cfg.master_shuffle {
                list.shuffle(&mut rand::thread_rng());
            }
            list
        } else {
            self.cfg.master_list()
        }
    }

    async fn try_master_once(&self, master: &str) -> Result<ActiveConnection, AgentError> {
        let (host, port) = prep_ip_port(master, &self.cfg);
        let ip = resolve_dns(&host, port, &self.cfg).await?;
        open_connection(&self.cfg, master, &ip, port).await
    }

    async fn try_master_with_retries(&self, master: &str) -> Result<ActiveConnection, AgentError> {
        let (host, port) = prep_ip_port(master, &self.cfg);
        let ip = resolve_dns(&host, port, &self.cfg).await?;

        let mut auth_wait = self.cfg.acceptance_wait_time;
        let mut tries = 0u32;
        loop {
            tries += 1;
            match open_connection(&self.cfg, master, &ip, port).await {
                Ok(connection) => return Ok(connection),
                Err(err) if tries < self.cfg.auth_tries.max(1) => {
                    warn!(
                        "Sign-in to {} failed (attempt {}): {}. Waiting {}s",
                        master, tries, err, auth_wait
                    );
                    tokio::time::sleep(Duration::from_secs(auth_wait)).await;
                    if self.cfg.acceptance_wait_time_max > auth_wait {
                        auth_wait = (auth_wait + self.cfg.acceptance_wait_time)
                            .min(self.cfg.acceptance_wait_time_max);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Split an optional `:port` suffix off the configured master value,
/// unless the uri format pins it to be an address only.
pub fn prep_ip_port(master: &str, cfg: &AgentConfig) -> (String, u16) {
    if cfg.master_uri_format == "ip_only" {
        return (master.to_string(), cfg.master_port);
    }
    match master.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (master.to_string(), cfg.master_port),
        },
        None => (master.to_string(), cfg.master_port),
    }
}

/// Resolve the controller address, honoring the ipv6 preference and
/// the `retry_dns` cadence. With `retry_dns == 0` an unresolvable
/// host falls back to `127.0.0.1` on the first attempt.
pub async fn resolve_dns(host: &str, port: u16, cfg: &AgentConfig) -> Result<String, AgentError> {
    if cfg.file_client == "local" && !cfg.use_master_when_local {
        return Ok("127.0.0.1".to_string());
    }
    if host.is_empty() {
        return Err(AgentError::ConfigFatal(
            "controller address could not be resolved: no master value set".into(),
        ));
    }

    loop {
        match lookup_once(host, port, cfg.ipv6).await {
            Some(ip) => return Ok(ip),
            None if cfg.retry_dns > 0 => {
                error!(
                    "Controller hostname {:?} not found. Retrying in {} seconds",
                    host, cfg.retry_dns
                );
                tokio::time::sleep(Duration::from_secs(cfg.retry_dns)).await;
            }
            None => {
                warn!(
                    "Controller hostname {:?} not found, falling back to 127.0.0.1",
                    host
                );
                return Ok("127.0.0.1".to_string());
            }
        }
    }
}

async fn lookup_once(host: &str, port: u16, prefer_v6: bool) -> Option<String> {
    let addrs: Vec<_> = lookup_host((host, port)).await.ok()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv6() == prefer_v6)
        .or_else(|| addrs.first())
        .map(|addr| addr.ip().to_string())
}

pub fn master_uri(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("tcp://[{ip}]:{port}")
    } else {
        format!("tcp://{ip}:{port}")
    }
}

/// Open the request channel, perform the sign-in handshake, open the
/// publish subscription, and start the request task.
async fn open_connection(
    cfg: &AgentConfig,
    master: &str,
    ip: &str,
    port: u16,
) -> Result<ActiveConnection, AgentError> {
    let req_uri = master_uri(ip, port);
    let pub_uri = master_uri(ip, cfg.publish_port());

    let mut dealer = DealerSocket::new();
    dealer
        .connect(&req_uri)
        .await
        .map_err(|err| AgentError::Channel(format!("cannot connect {req_uri}: {err}")))?;

    let token = sign_in(&mut dealer, &cfg.id, cfg.auth_timeout).await?;
    info!("Signed in to controller {} as {}", master, cfg.id);

    let mut sub = SubSocket::new();
    sub.connect(&pub_uri)
        .await
        .map_err(|err| AgentError::Channel(format!("cannot connect {pub_uri}: {err}")))?;
    sub.subscribe("")
        .await
        .map_err(|err| AgentError::Channel(format!("cannot subscribe {pub_uri}: {err}")))?;

    let (outbound, rx) = mpsc::unbounded_channel();
    let req_task = tokio::spawn(request_task(
        dealer,
        rx,
        token.clone(),
        master.to_string(),
    ));

    Ok(ActiveConnection {
        master: master.to_string(),
        master_uri: req_uri,
        publish_uri: pub_uri,
        token,
        sub,
        outbound,
        req_task,
    })
}

/// One sign-in round trip on the request channel.
async fn sign_in(
    dealer: &mut DealerSocket,
    id: &str,
    timeout_secs: u64,
) -> Result<String, AgentError> {
    let payload = SignInPayload::new(id);
    let frame = Frame::from_json(OpCode::SignIn, jid::next_seq(), &payload)
        .map_err(AgentError::Protocol)?;
    send_frame(dealer, &frame)
        .await
        .map_err(|err| AgentError::Channel(format!("sign-in send failed: {err}")))?;

    let reply = tokio::time::timeout(Duration::from_secs(timeout_secs), recv_frame(dealer))
        .await
        .map_err(|_| AgentError::TransportTimeout {
            master: id.to_string(),
            timeout_secs,
        })?
        .map_err(|err| AgentError::Channel(format!("sign-in recv failed: {err}")))?;

    match reply.opcode {
        OpCode::SignInAck => {
            let ack: SignInAck = reply.json().map_err(AgentError::Protocol)?;
            Ok(ack.token)
        }
        other => Err(AgentError::Channel(format!(
            "unexpected sign-in reply opcode {other:?}"
        ))),
    }
}

/// Owns the DEALER socket: serializes outbound loads, reattaches the
/// session token, applies per-send timeouts, and hands reply payloads
/// back when the sender asked for them. Timeouts are recoverable; the
/// load is logged and dropped.
async fn request_task(
    mut dealer: DealerSocket,
    mut rx: OutboundReceiver,
    token: String,
    master: String,
) {
    while let Some(OutboundLoad {
        mut load,
        timeout_secs,
        reply,
    }) = rx.recv().await
    {
        if let Some(obj) = load.as_object_mut() {
            obj.entry("tok".to_string())
                .or_insert_with(|| Value::String(token.clone()));
        }
        let seq = jid::next_seq();
        let frame = match Frame::from_json(OpCode::Request, seq, &load) {
            Ok(frame) => frame,
            Err(err) => {
                error!("Cannot encode request for {}: {}", master, err);
                continue;
            }
        };

        let exchange = async {
            send_frame(&mut dealer, &frame).await?;
            recv_frame(&mut dealer).await
        };
        match tokio::time::timeout(Duration::from_secs(timeout_secs.max(1)), exchange).await {
            Ok(Ok(response)) => {
                debug!(
                    "Request {} to {} acknowledged ({:?})",
                    seq, master, response.opcode
                );
                if let Some(reply) = reply {
                    let payload: Value = response.json().unwrap_or(Value::Null);
                    let _ = reply.send(payload);
                }
            }
            Ok(Err(err)) => {
                error!("Request to {} failed: {}", master, err);
            }
            Err(_) => {
                // the controller may be shut down or overloaded
                warn!(
                    "The agent failed to deliver a request to {} within {}s; dropping",
                    master, timeout_secs
                );
            }
        }
    }
    debug!("Request channel to {} closed", master);
}

/// Ship one protocol frame on the request channel.
pub async fn send_frame(socket: &mut DealerSocket, frame: &Frame) -> Result<(), AgentError> {
    socket
        .send(ZmqMessage::from(frame.encode()))
        .await
        .map_err(|err| AgentError::Channel(format!("zmq send: {err}")))
}

/// Receive one protocol frame from the request channel.
pub async fn recv_frame(socket: &mut DealerSocket) -> Result<Frame, AgentError> {
    let multipart = socket
        .recv()
        .await
        .map_err(|err| AgentError::Channel(format!("zmq recv: {err}")))?;
    decode_single(multipart)
}

/// Receive one protocol frame from the subscription socket.
pub async fn recv_publish(socket: &mut SubSocket) -> Result<Frame, AgentError> {
    let multipart = socket
        .recv()
        .await
        .map_err(|err| AgentError::Channel(format!("zmq recv: {err}")))?;
    decode_single(multipart)
}

/// The protocol is single-frame; multipart traffic is rejected rather
/// than guessed at.
fn decode_single(multipart: ZmqMessage) -> Result<Frame, AgentError> {
    let frames = multipart.into_vec();
    if frames.len() != 1 {
        return Err(AgentError::Protocol(ProtocolError::MultipartFrame(
            frames.len(),
        )));
    }
    Frame::decode(&frames[0]).map_err(AgentError::Protocol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_cfg() -> AgentConfig {
        let mut cfg = AgentConfig::load(None).unwrap();
        cfg.id = "web-01".to_string();
        cfg
    }

    #[test]
    fn prep_ip_port_forms() {
        let cfg = base_cfg();
        assert_eq!(prep_ip_port("controller", &cfg), ("controller".into(), 4506));
        assert_eq!(
            prep_ip_port("controller:1234", &cfg),
            ("controller".into(), 1234)
        );
        assert_eq!(
            prep_ip_port("127.0.0.1:1234", &cfg),
            ("127.0.0.1".into(), 1234)
        );
        // not a port number: treated as part of the host
        assert_eq!(
            prep_ip_port("controller:abc", &cfg),
            ("controller:abc".into(), 4506)
        );

        let mut ip_only = base_cfg();
        ip_only.master_uri_format = "ip_only".to_string();
        assert_eq!(
            prep_ip_port("controller:1234", &ip_only),
            ("controller:1234".into(), 4506)
        );
    }

    #[test]
    fn master_uri_wraps_v6() {
        assert_eq!(master_uri("10.0.0.1", 4506), "tcp://10.0.0.1:4506");
        assert_eq!(master_uri("::1", 4506), "tcp://[::1]:4506");
    }

    #[tokio::test]
    async fn unresolvable_host_falls_back_without_retry() {
        let mut cfg = base_cfg();
        cfg.retry_dns = 0;
        let ip = resolve_dns("definitely-not-a-real-host.invalid", 4506, &cfg)
            .await
            .unwrap();
        assert_eq!(ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn local_file_client_skips_dns() {
        let mut cfg = base_cfg();
        cfg.file_client = "local".to_string();
        let ip = resolve_dns("ignored-host.invalid", 4506, &cfg).await.unwrap();
        assert_eq!(ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn resolvable_host_resolves() {
        let cfg = base_cfg();
        let ip = resolve_dns("localhost", 4506, &cfg).await.unwrap();
        assert!(ip == "127.0.0.1" || ip == "::1");
    }

    #[tokio::test]
    async fn empty_master_is_fatal() {
        let cfg = base_cfg();
        let result = resolve_dns("", 4506, &cfg).await;
        assert!(matches!(result, Err(AgentError::ConfigFatal(_))));
    }

    #[test]
    fn failover_candidates_exclude_failed() {
        let mut cfg = base_cfg();
        cfg.master = json!(["a", "b", "c"]);
        cfg.master_type = "failover".to_string();
        let mut manager = ConnectionManager::new(cfg);
        manager.current_master = Some("b".to_string());

        assert_eq!(manager.candidates(false), vec!["a", "b", "c"]);
        assert_eq!(manager.candidates(true), vec!["a", "c"]);
    }

    #[test]
    fn binding_state_transitions() {
        let manager = ConnectionManager::new(base_cfg());
        assert_eq!(manager.state, ConnState::Disconnected);
        let mut manager = manager;
        manager.mark_connected();
        assert_eq!(manager.state, ConnState::Connected);
        manager.mark_disconnected();
        assert_eq!(manager.state, ConnState::Disconnected);
    }
}
