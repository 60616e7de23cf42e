use std::sync::atomic::{AtomicBool, Ordering};

use locus::scope::encode_split_entry;
use locus::{GroupScope, LocusError, Rank, Substrate};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::TcpConfig;
use crate::error::{Result, TcpError};
use crate::hub::{self, Hub};
use crate::protocol::{HubMessage, PROTOCOL_VERSION, read_message, write_message};

/// Blocking substrate for jobs where every rank is its own OS process.
///
/// Owns a tokio runtime and calls `block_on()` for each operation. All
/// collectives go through the job's [`Hub`]; with [`HubMode::Embedded`]
/// rank 0 runs it on this runtime.
///
/// [`HubMode::Embedded`]: crate::HubMode::Embedded
pub struct TcpSubstrate {
    config: TcpConfig,
    rt: Runtime,
    link: Option<Mutex<TcpStream>>,
    hub_task: Option<JoinHandle<Result<()>>>,
    down: AtomicBool,
}

impl TcpSubstrate {
    /// Validate `config` and build the runtime. Nothing is contacted until
    /// `startup`.
    pub fn new(config: TcpConfig) -> Result<Self> {
        config.validate()?;
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("locus-tcp")
            .enable_all()
            .build()?;
        Ok(Self {
            config,
            rt,
            link: None,
            hub_task: None,
            down: AtomicBool::new(false),
        })
    }

    /// Build from the launcher environment (see [`TcpConfig::from_env`]).
    pub fn from_env() -> Result<Self> {
        Self::new(TcpConfig::from_env()?)
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    fn link(&self, operation: &'static str) -> locus::Result<&Mutex<TcpStream>> {
        if self.down.load(Ordering::Acquire) {
            return Err(LocusError::substrate(operation, "substrate already shut down"));
        }
        self.link
            .as_ref()
            .ok_or_else(|| LocusError::substrate(operation, "substrate not started"))
    }

    /// Contribute `block` to the next collective on `scope` and wait for
    /// every member's block.
    fn exchange(
        &self,
        operation: &'static str,
        scope: &GroupScope,
        block: &[u8],
    ) -> locus::Result<Vec<Vec<u8>>> {
        let link = self.link(operation)?;
        let comm_id = scope.comm_id();
        let epoch = scope.next_epoch();
        let contribution = HubMessage::Contribute {
            comm_id,
            epoch,
            index: scope.rank(),
            expected: scope.size(),
            payload: block.to_vec(),
        };

        self.rt
            .block_on(async {
                let mut stream = link.lock().await;
                write_message(&mut *stream, &contribution).await?;
                match read_message(&mut *stream).await? {
                    Some(HubMessage::Complete {
                        comm_id: c,
                        epoch: e,
                        payloads,
                    }) if c == comm_id && e == epoch => Ok(payloads),
                    Some(other) => Err(TcpError::UnexpectedMessage(format!(
                        "{other:?} while waiting for comm {comm_id} epoch {epoch}"
                    ))),
                    None => Err(TcpError::HubClosed),
                }
            })
            .map_err(|e| e.into_locus(operation))
    }
}

/// Start the hub if this rank hosts it, then connect and handshake.
async fn join(config: &TcpConfig) -> Result<(TcpStream, Option<JoinHandle<Result<()>>>)> {
    let mut hub_task = None;
    if config.hosts_hub() {
        let hub = Hub::bind(&config.hub_addr, config.world_size)
            .await?
            .with_formation_timeout(config.formation_timeout);
        tracing::info!(addr = %hub.local_addr()?, "serving hub");
        hub_task = Some(tokio::spawn(hub.serve()));
    }

    let mut stream = hub::connect(&config.hub_addr, config.connect_timeout).await?;
    write_message(
        &mut stream,
        &HubMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            rank: config.rank,
            world_size: config.world_size,
        },
    )
    .await?;

    match read_message(&mut stream).await? {
        Some(HubMessage::Welcome { world_size }) if world_size == config.world_size => {
            Ok((stream, hub_task))
        }
        Some(HubMessage::Welcome { world_size }) => Err(TcpError::Protocol(format!(
            "hub formed a job of {world_size}, expected {}",
            config.world_size
        ))),
        Some(HubMessage::Reject { reason }) => Err(TcpError::Rejected {
            rank: config.rank,
            reason,
        }),
        Some(other) => Err(TcpError::UnexpectedMessage(format!("{other:?}"))),
        None => Err(TcpError::HubClosed),
    }
}

impl Substrate for TcpSubstrate {
    type Scope = GroupScope;

    fn startup(&mut self) -> locus::Result<()> {
        if self.link.is_some() || self.down.load(Ordering::Acquire) {
            return Err(LocusError::substrate("startup", "startup called twice"));
        }
        let (stream, hub_task) = self
            .rt
            .block_on(join(&self.config))
            .map_err(|e| e.into_locus("startup"))?;
        self.link = Some(Mutex::new(stream));
        self.hub_task = hub_task;

        tracing::debug!(
            rank = self.config.rank,
            world_size = self.config.world_size,
            "joined job"
        );
        Ok(())
    }

    fn shutdown(&mut self) -> locus::Result<()> {
        let link = self.link("shutdown")?;
        self.rt
            .block_on(async {
                let mut stream = link.lock().await;
                write_message(&mut *stream, &HubMessage::Goodbye).await
            })
            .map_err(|e| e.into_locus("shutdown"))?;
        self.down.store(true, Ordering::Release);
        self.link = None;

        if let Some(task) = self.hub_task.take() {
            self.rt
                .block_on(task)
                .map_err(|e| TcpError::HubTask(e.to_string()))
                .and_then(|served| served)
                .map_err(|e| e.into_locus("shutdown"))?;
            tracing::info!("hub finished");
        }
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    fn self_rank(&self) -> locus::Result<Rank> {
        self.link("self_rank")?;
        Ok(self.config.rank)
    }

    fn group_size(&self) -> locus::Result<i32> {
        self.link("group_size")?;
        Ok(self.config.world_size)
    }

    fn host_name(&self) -> locus::Result<String> {
        match &self.config.hostname {
            Some(name) => Ok(name.clone()),
            None => Ok(locus::local_hostname()),
        }
    }

    fn world(&self) -> locus::Result<GroupScope> {
        self.link("world")?;
        Ok(GroupScope::world(self.config.rank, self.config.world_size))
    }

    fn scope_rank(&self, scope: &GroupScope) -> Rank {
        scope.rank()
    }

    fn scope_size(&self, scope: &GroupScope) -> i32 {
        scope.size()
    }

    fn all_gather(&self, scope: &GroupScope, local: &[u8]) -> locus::Result<Vec<u8>> {
        let blocks = self.exchange("all_gather", scope, local)?;
        if blocks.len() != scope.size() as usize {
            return Err(LocusError::substrate(
                "all_gather",
                format!("got {} blocks for a scope of {}", blocks.len(), scope.size()),
            ));
        }
        if let Some(odd) = blocks.iter().find(|b| b.len() != local.len()) {
            return Err(LocusError::substrate(
                "all_gather",
                format!(
                    "block size mismatch: local {} bytes, peer {} bytes",
                    local.len(),
                    odd.len()
                ),
            ));
        }
        Ok(blocks.concat())
    }

    fn split(&self, parent: &GroupScope, color: i32, key: i32) -> locus::Result<GroupScope> {
        let entry = encode_split_entry(color, key);
        let gathered = self.all_gather(parent, &entry)?;
        parent.derive_split(&gathered, color)
    }

    fn barrier(&self, scope: &GroupScope) -> locus::Result<()> {
        self.exchange("barrier", scope, &[])?;
        Ok(())
    }

    fn release(&self, scope: GroupScope) -> locus::Result<()> {
        self.link("release")?;
        drop(scope);
        Ok(())
    }
}
