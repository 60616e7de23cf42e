use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use locus::Rank;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::{Result, TcpError};
use crate::protocol::{
    HubMessage, PROTOCOL_VERSION, encode_message, read_message, write_message,
};

/// Rendezvous point for a job's collectives.
///
/// The hub admits exactly `world_size` ranks, each with a distinct rank id.
/// It then completes every collective `(comm_id, epoch)` once all of its
/// expected contributions have arrived, sending the ordered result back to
/// each contributor. It returns after every rank has said goodbye.
///
/// The hub only relays; it never decides anything about locales.
pub struct Hub {
    listener: TcpListener,
    world_size: i32,
    formation_timeout: Duration,
    hello_timeout: Duration,
}

const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(5);

enum Event {
    Message(Rank, HubMessage),
    Closed(Rank),
    Failed(Rank, TcpError),
}

/// A collective waiting for contributions.
#[derive(Debug)]
struct Pending {
    blocks: Vec<Option<Vec<u8>>>,
    /// Job rank of each contributor, for the fan-out.
    contributors: Vec<Rank>,
}

impl Hub {
    /// Bind a hub for a job of `world_size` ranks. `addr` is `host:port`;
    /// the host may be a name.
    pub async fn bind(addr: &str, world_size: i32) -> Result<Self> {
        if world_size <= 0 {
            return Err(TcpError::Config(format!(
                "world size must be positive, got {world_size}"
            )));
        }
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            world_size,
            formation_timeout: Duration::from_secs(60),
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        })
    }

    /// Set how long to wait for the whole job to join.
    pub fn with_formation_timeout(mut self, timeout: Duration) -> Self {
        self.formation_timeout = timeout;
        self
    }

    /// Set how long one connection may take to send its Hello before it is
    /// dropped.
    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Get the local address the hub is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Admit the job, then relay collectives until every rank leaves.
    pub async fn serve(self) -> Result<()> {
        let links = self.admit().await?;

        let (tx, mut rx) = mpsc::channel(256);
        let mut writers: HashMap<Rank, OwnedWriteHalf> = HashMap::new();
        for (rank, reader, writer) in links {
            writers.insert(rank, writer);
            tokio::spawn(forward(rank, reader, tx.clone()));
        }
        drop(tx);

        let welcome = encode_message(&HubMessage::Welcome {
            world_size: self.world_size,
        })?;
        for writer in writers.values_mut() {
            write_frame(writer, &welcome).await?;
        }
        tracing::info!(world_size = self.world_size, "hub: job formed");

        let mut pending: HashMap<(u64, u64), Pending> = HashMap::new();
        let mut departed: HashSet<Rank> = HashSet::new();

        while departed.len() < self.world_size as usize {
            let Some(event) = rx.recv().await else {
                break;
            };
            match event {
                Event::Message(
                    rank,
                    HubMessage::Contribute {
                        comm_id,
                        epoch,
                        index,
                        expected,
                        payload,
                    },
                ) => {
                    let slot = contribute(
                        &mut pending,
                        self.world_size,
                        rank,
                        (comm_id, epoch),
                        index,
                        expected,
                        payload,
                    )?;
                    if let Some(done) = slot {
                        complete(&mut writers, comm_id, epoch, done).await?;
                    }
                }
                Event::Message(rank, HubMessage::Goodbye) => {
                    departed.insert(rank);
                    tracing::debug!(rank, left = departed.len(), "hub: rank departed");
                }
                Event::Message(rank, other) => {
                    return Err(TcpError::UnexpectedMessage(format!(
                        "{other:?} from rank {rank}"
                    )));
                }
                Event::Closed(rank) => {
                    if !departed.contains(&rank) {
                        return Err(TcpError::PeerLost { rank });
                    }
                }
                Event::Failed(rank, e) => {
                    if !departed.contains(&rank) {
                        tracing::warn!(rank, "hub: read from rank failed: {e}");
                        return Err(TcpError::PeerLost { rank });
                    }
                }
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                unfinished = pending.len(),
                "hub: job ended with incomplete collectives"
            );
        }
        tracing::info!("hub: all ranks departed");
        Ok(())
    }

    /// Accept connections until every rank has introduced itself.
    async fn admit(&self) -> Result<Vec<(Rank, OwnedReadHalf, OwnedWriteHalf)>> {
        let deadline = tokio::time::Instant::now() + self.formation_timeout;
        let mut links: Vec<(Rank, OwnedReadHalf, OwnedWriteHalf)> = Vec::new();

        while (links.len() as i32) < self.world_size {
            let (stream, peer) = tokio::select! {
                result = self.listener.accept() => result?,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(TcpError::FormationTimeout {
                        joined: links.len() as i32,
                        expected: self.world_size,
                    });
                }
            };
            stream.set_nodelay(true)?;
            let (mut reader, mut writer) = stream.into_split();

            let hello_deadline = (tokio::time::Instant::now() + self.hello_timeout).min(deadline);
            let read = tokio::time::timeout_at(hello_deadline, read_message(&mut reader));
            let hello = match read.await {
                Ok(Ok(Some(msg))) => msg,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(%peer, "hub: bad handshake: {e}");
                    continue;
                }
                Err(_) if hello_deadline < deadline => {
                    tracing::warn!(%peer, timeout = ?self.hello_timeout, "hub: no Hello, dropping");
                    continue;
                }
                Err(_) => {
                    return Err(TcpError::FormationTimeout {
                        joined: links.len() as i32,
                        expected: self.world_size,
                    });
                }
            };

            match self.check_hello(&hello, &links) {
                Ok(rank) => {
                    links.push((rank, reader, writer));
                    tracing::info!(
                        "rank joined: rank={rank}, total={}/{}",
                        links.len(),
                        self.world_size
                    );
                }
                Err(reason) => {
                    tracing::warn!(%peer, "hub: rejecting {hello:?}: {reason}");
                    if let Err(e) = write_message(&mut writer, &HubMessage::Reject { reason }).await {
                        tracing::debug!(%peer, "hub: could not deliver Reject: {e}");
                    }
                }
            }
        }

        Ok(links)
    }

    fn check_hello(
        &self,
        hello: &HubMessage,
        links: &[(Rank, OwnedReadHalf, OwnedWriteHalf)],
    ) -> std::result::Result<Rank, String> {
        let HubMessage::Hello {
            protocol_version,
            rank,
            world_size,
        } = *hello
        else {
            return Err("expected Hello".into());
        };
        if protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version {protocol_version}, hub speaks {PROTOCOL_VERSION}"
            ));
        }
        if world_size != self.world_size {
            return Err(format!(
                "world size {world_size}, hub expects {}",
                self.world_size
            ));
        }
        if rank < 0 || rank >= self.world_size {
            return Err(format!("rank {rank} outside job of size {world_size}"));
        }
        if links.iter().any(|(r, _, _)| *r == rank) {
            return Err(format!("rank {rank} already joined"));
        }
        Ok(rank)
    }
}

/// Record one contribution; return the finished collective if it was the
/// last one missing.
fn contribute(
    pending: &mut HashMap<(u64, u64), Pending>,
    world_size: i32,
    rank: Rank,
    key: (u64, u64),
    index: i32,
    expected: i32,
    payload: Vec<u8>,
) -> Result<Option<Pending>> {
    if expected <= 0 || expected > world_size {
        return Err(TcpError::Protocol(format!(
            "rank {rank} expects {expected} contributions in a job of {world_size}"
        )));
    }
    if index < 0 || index >= expected {
        return Err(TcpError::Protocol(format!(
            "rank {rank} sent index {index} of {expected}"
        )));
    }
    let slot = pending.entry(key).or_insert_with(|| Pending {
        blocks: vec![None; expected as usize],
        contributors: Vec::with_capacity(expected as usize),
    });
    if slot.blocks.len() != expected as usize {
        return Err(TcpError::Protocol(format!(
            "rank {rank} expects {expected} contributions to comm {} epoch {}, others expect {}",
            key.0,
            key.1,
            slot.blocks.len()
        )));
    }
    if slot.blocks[index as usize].replace(payload).is_some() {
        return Err(TcpError::Protocol(format!(
            "scope index {index} contributed twice to comm {} epoch {}",
            key.0, key.1
        )));
    }
    slot.contributors.push(rank);

    if slot.contributors.len() == slot.blocks.len() {
        Ok(pending.remove(&key))
    } else {
        Ok(None)
    }
}

async fn complete(
    writers: &mut HashMap<Rank, OwnedWriteHalf>,
    comm_id: u64,
    epoch: u64,
    done: Pending,
) -> Result<()> {
    let Pending {
        blocks,
        contributors,
    } = done;
    let frame = encode_message(&HubMessage::Complete {
        comm_id,
        epoch,
        payloads: blocks.into_iter().map(Option::unwrap_or_default).collect(),
    })?;
    for rank in contributors {
        let writer = writers
            .get_mut(&rank)
            .ok_or(TcpError::PeerLost { rank })?;
        write_frame(writer, &frame).await?;
    }
    tracing::trace!(comm_id, epoch, "hub: collective complete");
    Ok(())
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn forward(rank: Rank, mut reader: OwnedReadHalf, tx: mpsc::Sender<Event>) {
    loop {
        let event = match read_message(&mut reader).await {
            Ok(Some(msg)) => {
                let goodbye = msg == HubMessage::Goodbye;
                if tx.send(Event::Message(rank, msg)).await.is_err() || goodbye {
                    return;
                }
                continue;
            }
            Ok(None) => Event::Closed(rank),
            Err(e) => Event::Failed(rank, e),
        };
        let _ = tx.send(event).await;
        return;
    }
}

/// Connect to a hub, retrying until `timeout` elapses.
pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if tokio::time::Instant::now() < deadline => {
                tracing::trace!(%addr, "hub not reachable yet: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(_) => {
                return Err(TcpError::HubUnreachable {
                    addr: addr.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }
}
