//! Process wiring
//!
//! One shard per conductor: an actor task owning the conductor's routing
//! state, plus an HTTP/WebSocket listener feeding it. Shards share nothing.

pub mod http;
pub mod websocket;

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::conductor::{AdminClient, WsConnector};
use crate::config::{Args, ShardConfig};
use crate::proxy::multiplexer::{self, Multiplexer, ShardHandle};
use crate::proxy::pool::UpstreamPool;
use crate::types::{MuxError, Result};

/// A conductor's running shard
pub struct Shard {
    pub handle: ShardHandle,
    pub local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Shard {
    /// Stop the listener and the actor
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Bind the conductor's local endpoint and start its actor and listener
pub async fn start_shard(config: &ShardConfig) -> Result<Shard> {
    let listener = TcpListener::bind(config.listen).await.map_err(|e| {
        MuxError::Config(format!(
            "conductor {}: cannot bind {}: {}",
            config.conductor, config.listen, e
        ))
    })?;
    let local_addr = listener.local_addr()?;

    let (handle, events) = ShardHandle::channel(config.conductor);
    let connector = WsConnector::new(
        config.upstream_url.clone(),
        config.connect_timeout,
        handle.clone(),
    );
    let pool = UpstreamPool::new(config.conductor, connector, config.pool_size);
    let actor = multiplexer::spawn(
        Multiplexer::new(config.conductor, pool, config.pending_ttl),
        events,
    );
    let listener = tokio::spawn(http::serve(listener, handle.clone()));

    info!(
        conductor = config.conductor,
        "Shard up: {} -> {} (pool {})", local_addr, config.upstream_url, config.pool_size
    );

    Ok(Shard {
        handle,
        local_addr,
        tasks: vec![listener, actor],
    })
}

/// Tell the conductor's admin interface to expose the app interface the pool dials
async fn attach_interface(config: ShardConfig) {
    let client = AdminClient::new(config.admin_url.clone()).with_timeout(config.connect_timeout);
    match client.attach_app_interface(config.upstream_port).await {
        Ok(port) => info!(
            conductor = config.conductor,
            "App interface attached on port {}", port
        ),
        Err(e) => warn!(
            conductor = config.conductor,
            "Could not attach app interface on port {} via {}: {}",
            config.upstream_port,
            config.admin_url,
            e
        ),
    }
}

/// Run every conductor's shard until Ctrl-C
pub async fn run(args: &Args) -> Result<()> {
    let mut shards = Vec::with_capacity(args.conductor_count);
    let mut attach_tasks = Vec::new();

    for conductor in 0..args.conductor_count {
        let config = args.shard_config(conductor).map_err(MuxError::Config)?;
        shards.push(start_shard(&config).await?);

        if args.attach_interfaces {
            attach_tasks.push(tokio::spawn(attach_interface(config)));
        }
    }

    info!("Multiplexing {} conductor(s)", shards.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping {} shard(s)", shards.len());

    for task in &attach_tasks {
        task.abort();
    }
    for shard in &shards {
        shard.abort();
    }

    Ok(())
}
