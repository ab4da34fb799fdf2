//! Line-delimited JSON RPC over TCP.
//!
//! One call per connection: the client writes a [`Call`] line and reads back
//! a [`Response`] line. Peers and the resource each listen on their own port.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::MessageBus;
use crate::config::PeerMap;
use crate::order::{Message, PeerId, Timestamp};
use crate::peer::Peer;
use crate::sync::{ProcessState, Resource, ResourceServer, StopSignal};
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    // Serialized [`Message`]
    Message { payload: String },
    State,
    Time,
    Use,
    SetServiceTime { millis: u64 },
    ShutDown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Empty,
    Message(String),
    State(ProcessState),
    Time(Timestamp),
    Busy,
    InvalidConfig(String),
    UnknownMessageType(String),
    Error(String),
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        match e {
            Error::ResourceBusy => Response::Busy,
            Error::InvalidConfig(m) => Response::InvalidConfig(m),
            Error::UnknownMessageType(t) => Response::UnknownMessageType(t),
            e => Response::Error(e.to_string()),
        }
    }
}

impl Response {
    fn into_result(self) -> Result<Self> {
        match self {
            Response::Busy => Err(Error::ResourceBusy),
            Response::InvalidConfig(m) => Err(Error::InvalidConfig(m)),
            Response::UnknownMessageType(t) => Err(Error::UnknownMessageType(t)),
            Response::Error(m) => Err(Error::Remote(m)),
            r => Ok(r),
        }
    }
}

fn unexpected(r: Response) -> Error {
    Error::Remote(format!("unexpected response {r:?}"))
}

/// Handle on a remote endpoint, peer or resource.
#[derive(Clone, Debug)]
pub struct Client {
    addr: SocketAddr,
}

impl Client {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn call(&self, call: &Call) -> Result<Response> {
        let mut stream = TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT)?;
        let mut line = serde_json::to_string(call)?;
        line.push('\n');
        stream.write_all(line.as_bytes())?;

        let mut reply = String::new();
        if BufReader::new(stream).read_line(&mut reply)? == 0 {
            // Hung up without answering
            let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "closed before reply");
            return Err(eof.into());
        }
        serde_json::from_str::<Response>(&reply)?.into_result()
    }

    pub fn message(&self, message: Message) -> Result<Option<Message>> {
        let payload = message.serialize()?;
        match self.call(&Call::Message { payload })? {
            Response::Message(m) => Ok(Some(Message::deserialize(&m)?)),
            Response::Empty => Ok(None),
            r => Err(unexpected(r)),
        }
    }

    pub fn state(&self) -> Result<ProcessState> {
        match self.call(&Call::State)? {
            Response::State(s) => Ok(s),
            r => Err(unexpected(r)),
        }
    }

    pub fn time(&self) -> Result<Timestamp> {
        match self.call(&Call::Time)? {
            Response::Time(t) => Ok(t),
            r => Err(unexpected(r)),
        }
    }

    pub fn set_service_time(&self, t: Duration) -> Result<()> {
        let millis = u64::try_from(t.as_millis())
            .map_err(|_| Error::InvalidConfig(format!("service time {t:?} out of range")))?;
        self.call(&Call::SetServiceTime { millis })?;
        Ok(())
    }

    pub fn shut_down(&self) -> Result<()> {
        self.call(&Call::ShutDown)?;
        Ok(())
    }
}

// Remote resource endpoint
impl Resource for Client {
    fn use_resource(&self) -> Result<()> {
        self.call(&Call::Use)?;
        Ok(())
    }
}

/// Peer-to-peer delivery over TCP, one connection per message.
pub struct TcpBus {
    id: PeerId,
    peers: PeerMap,
}

impl TcpBus {
    pub fn new(id: PeerId, peers: PeerMap) -> Result<Self> {
        peers.addr(id)?;
        Ok(Self { id, peers })
    }
}

impl MessageBus for TcpBus {
    fn send(&self, message: Message, target: PeerId) -> Result<Option<Message>> {
        let client = Client::new(self.peers.addr(target)?);
        debug!("{} sending {message:?} to {target}", self.id);
        client.message(message).map_err(|e| match e {
            Error::Io(e) => Error::PeerUnreachable {
                peer: target,
                reason: e.to_string(),
            },
            e => e,
        })
    }
}

/// What an endpoint does with a decoded call.
pub trait Service: Send + Sync + 'static {
    fn call(&self, call: Call, server: &ServerHandle) -> Result<Response>;
}

/// Lets a service (or anyone else) stop the server it runs in.
#[derive(Clone)]
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<StopSignal>,
}

impl ServerHandle {
    pub fn shut_down(&self) {
        self.stop.stop();
        // Wake the accept loop
        let _ = TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn stop_signal(&self) -> &Arc<StopSignal> {
        &self.stop
    }
}

pub struct Server {
    handle: ServerHandle,
    thread: JoinHandle<()>,
}

impl Server {
    /// Serves `service` on `listener`, one thread per connection.
    pub fn spawn<S: Service>(listener: TcpListener, service: Arc<S>) -> Result<Self> {
        let handle = ServerHandle {
            addr: listener.local_addr()?,
            stop: Arc::new(StopSignal::default()),
        };
        info!("listening on {}", handle.addr);
        let thread = std::thread::spawn({
            let handle = handle.clone();
            move || accept_loop(listener, service, handle)
        });
        Ok(Self { handle, thread })
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    pub fn shut_down(&self) {
        self.handle.shut_down()
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            warn!("server on {} panicked", self.handle.addr);
        }
    }
}

fn accept_loop<S: Service>(listener: TcpListener, service: Arc<S>, handle: ServerHandle) {
    for stream in listener.incoming() {
        if handle.is_stopped() {
            break;
        }
        match stream {
            Ok(stream) => {
                let service = service.clone();
                let handle = handle.clone();
                std::thread::spawn(move || {
                    if let Err(e) = serve_connection(stream, &*service, &handle) {
                        warn!("connection failed: {e}");
                    }
                });
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    info!("server on {} stopped", handle.addr);
}

fn serve_connection<S: Service>(stream: TcpStream, service: &S, handle: &ServerHandle) -> Result<()> {
    let mut writer = stream.try_clone()?;
    for line in BufReader::new(stream).lines() {
        let line = line?;
        let response = serde_json::from_str::<Call>(&line)
            .map_err(Error::from)
            .and_then(|call| service.call(call, handle))
            .unwrap_or_else(Response::from);
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes())?;
    }
    Ok(())
}

/// Peer endpoint: `message`, `state`, `time`, `set_service_time`, `shut_down`.
pub struct PeerService<B, R> {
    peer: Arc<Peer<B, R>>,
}

impl<B, R> PeerService<B, R> {
    pub fn new(peer: Arc<Peer<B, R>>) -> Self {
        Self { peer }
    }
}

impl<B, R> Service for PeerService<B, R>
where
    B: MessageBus + Send + Sync + 'static,
    R: Resource + Send + Sync + 'static,
{
    fn call(&self, call: Call, server: &ServerHandle) -> Result<Response> {
        match call {
            Call::Message { payload } => {
                let message = Message::deserialize(&payload)?;
                match self.peer.core().dispatch(message) {
                    Some(reply) => Ok(Response::Message(reply.serialize()?)),
                    None => Ok(Response::Empty),
                }
            }
            Call::State => Ok(Response::State(self.peer.state())),
            Call::Time => Ok(Response::Time(self.peer.time())),
            Call::SetServiceTime { millis } => {
                self.peer.set_think_time(Duration::from_millis(millis))?;
                Ok(Response::Empty)
            }
            Call::ShutDown => {
                info!("{} shutting down", self.peer.id());
                server.shut_down();
                Ok(Response::Empty)
            }
            Call::Use => Err(Error::Remote("use is served by the resource".into())),
        }
    }
}

/// Resource endpoint: `use`, `set_service_time`, `shut_down`.
pub struct ResourceService {
    resource: Arc<ResourceServer>,
}

impl ResourceService {
    pub fn new(resource: Arc<ResourceServer>) -> Self {
        Self { resource }
    }
}

impl Service for ResourceService {
    fn call(&self, call: Call, server: &ServerHandle) -> Result<Response> {
        match call {
            Call::Use => {
                self.resource.use_resource()?;
                Ok(Response::Empty)
            }
            Call::SetServiceTime { millis } => {
                self.resource
                    .set_service_time(Duration::from_millis(millis))?;
                Ok(Response::Empty)
            }
            Call::ShutDown => {
                info!("resource shutting down");
                server.shut_down();
                Ok(Response::Empty)
            }
            Call::Message { .. } | Call::State | Call::Time => {
                Err(Error::Remote("not a peer endpoint".into()))
            }
        }
    }
}
