//! Newline-delimited JSON over TCP (spec §6's concrete framing, SPEC_FULL
//! §6). Kept behind a small [`Transport`] trait so `scheduler_core` is never
//! compiled against a socket type; a second implementation (an in-memory
//! transport for tests, or a different wire format) only has to satisfy
//! this trait.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use scheduler_channels::mspc::{self, SendChannel};
use scheduler_core::{ClientId, Message, Outbound, Scheduler, WorkerAddr};
use scheduler_trace::{debug, info, warn};

use crate::peer::PeerRegistry;
use crate::protocol::{self, ClientHello, ClientInbound, ClientOutbound, WorkerHello, WorkerInbound, WorkerOutbound};

/// A source of inbound stimuli and sink for outbound peer messages. The
/// event loop in [`run`] only depends on this trait, not on TCP directly.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn serve(
        self: Box<Self>,
        inbound: SendChannel<Message>,
        workers: PeerRegistry<WorkerOutbound>,
        clients: PeerRegistry<ClientOutbound>,
    ) -> anyhow::Result<()>;
}

/// NDJSON-over-TCP, one connection per worker or client, distinguished by
/// whichever hello record arrives first on the connection.
pub struct TcpTransport {
    pub bind_address: String,
    pub batch_window: Duration,
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn serve(
        self: Box<Self>,
        inbound: SendChannel<Message>,
        workers: PeerRegistry<WorkerOutbound>,
        clients: PeerRegistry<ClientOutbound>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        info!("schedulerd listening on {}", self.bind_address);

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("accepted connection from {}", addr);
            let inbound = inbound.clone();
            let workers = workers.clone();
            let clients = clients.clone();
            let batch_window = self.batch_window;
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, inbound, workers, clients, batch_window).await {
                    warn!("connection from {} ended with an error: {}", addr, err);
                }
            });
        }
    }
}

/// One line of a hello record peeked before we know which kind of peer this
/// connection belongs to.
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum Hello {
    Worker(WorkerHello),
    Client(ClientHello),
}

async fn handle_connection(
    stream: TcpStream,
    mut inbound: SendChannel<Message>,
    workers: PeerRegistry<WorkerOutbound>,
    clients: PeerRegistry<ClientOutbound>,
    batch_window: Duration,
) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    let Some(hello_line) = reader.next_line().await? else {
        return Ok(());
    };
    let hello: Hello = serde_json::from_str(&hello_line)?;

    match hello {
        Hello::Worker(hello) => {
            let address = WorkerAddr::from(hello.address);
            inbound
                .async_send(Message::AddWorker {
                    address: address.clone(),
                    hostname: hello.hostname,
                    ncores: hello.ncores,
                })
                .await?;

            let (tx, rx) = mspc::create::<WorkerOutbound>();
            workers.register(address.to_string(), tx);
            let writer_handle = tokio::spawn(write_loop(write_half, rx, batch_window));

            while let Some(line) = reader.next_line().await? {
                match serde_json::from_str::<WorkerInbound>(&line) {
                    Ok(op) => {
                        let message = op.into_message(&address);
                        if inbound.async_send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("malformed worker message from {}: {}", address, err),
                }
            }

            workers.remove(address.as_str());
            writer_handle.abort();
            let _ = inbound.async_send(Message::RemoveWorker { address }).await;
        }
        Hello::Client(hello) => {
            let client = ClientId::from(hello.client);
            inbound.async_send(Message::AddClient { client: client.clone() }).await?;

            let (tx, rx) = mspc::create::<ClientOutbound>();
            clients.register(client.to_string(), tx);
            let writer_handle = tokio::spawn(write_loop(write_half, rx, batch_window));

            while let Some(line) = reader.next_line().await? {
                match serde_json::from_str::<ClientInbound>(&line) {
                    Ok(op) => {
                        let message = op.into_message(&client);
                        if inbound.async_send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("malformed client message from {}: {}", client, err),
                }
            }

            clients.remove(client.as_str());
            writer_handle.abort();
            let _ = inbound.async_send(Message::RemoveClient { client }).await;
        }
    }

    Ok(())
}

/// Drains a peer's outbound queue on the batching window from spec §5: the
/// first message after idle sends immediately, anything that piles up while
/// that write is in flight goes out together on the next tick.
async fn write_loop<T: serde::Serialize + Send + 'static>(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: scheduler_channels::mspc::ReceiveChannel<T>,
    batch_window: Duration,
) {
    loop {
        let Ok(first) = rx.async_receive().await else {
            return;
        };
        let mut batch = vec![first];
        tokio::time::sleep(batch_window).await;
        batch.extend(rx.drain());

        for message in batch {
            let Ok(mut line) = serde_json::to_vec(&message) else {
                continue;
            };
            line.push(b'\n');
            if write_half.write_all(&line).await.is_err() {
                return;
            }
        }
        if write_half.flush().await.is_err() {
            return;
        }
    }
}

fn route(outbound: Vec<Outbound>, workers: &PeerRegistry<WorkerOutbound>, clients: &PeerRegistry<ClientOutbound>) {
    let (to_workers, to_clients) = protocol::split_outbound(outbound);
    for (addr, message) in to_workers {
        workers.send(&addr, message);
    }
    for (id, message) in to_clients {
        clients.send(&id, message);
    }
}

/// Runs the scheduler's single-threaded event loop: drains `inbound`,
/// applies each message to completion (spec §5), routes the resulting
/// `Outbound`s to whichever peer registry they belong to, and on a
/// `heartbeat_interval` tick checks for workers that stopped heartbeating
/// (spec §5 "Timeouts").
pub async fn run_event_loop(
    mut scheduler: Scheduler,
    mut inbound: scheduler_channels::mspc::ReceiveChannel<Message>,
    workers: PeerRegistry<WorkerOutbound>,
    clients: PeerRegistry<ClientOutbound>,
    heartbeat_interval: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = inbound.async_receive() => {
                let Ok(message) = message else {
                    info!("inbound channel closed; scheduler event loop exiting");
                    return;
                };
                route(scheduler.handle_message(message), &workers, &clients);
            }
            _ = ticker.tick() => {
                route(scheduler.check_heartbeat_timeouts(std::time::Instant::now()), &workers, &clients);
            }
        }
    }
}
