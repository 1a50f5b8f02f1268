//! 内存连接工厂与监听器注册表。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 以进程内注册表模拟“地址 → 监听器”的绑定关系，覆盖地址冲突、连接拒绝、
//!   监听器关闭等需要 OS 套接字才能复现的场景；
//! - 每个监听器持有一条多生产者单消费者队列，排队的连接请求在 `accept` 时才生成连接对。
//!
//! ## 逻辑（How）
//! - 注册表使用 [`DashMap`]，`listen` 通过 `entry` 原子地检测占用；
//! - `connect` 把携带 `oneshot` 应答通道的请求放入队列并等待应答；取消时关闭应答端，
//!   接入方发现应答失败后释放孤儿连接并继续处理下一个请求；若连接在关闭前已经交付，
//!   由 `connect` 自己取出并释放，接入方拿到的服务端随后读到 EOF；
//! - 监听器释放时先移除注册，再关闭队列并以 `Connectivity` 失败所有排队请求。

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde::Deserialize;
use tether_core::{
    BoxConnection, BoxListener, Cancellation, Connection, ConnectionError, ConnectionFactory,
    ConnectionListener, ConnectionProperties, Endpoint, ErrorKind, Lifecycle, Result,
};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    connection::MemoryConnection,
    error::{self, ADDRESS_IN_USE, CONNECTION_REFUSED, LISTENER_CLOSED},
    pipe::PipeOptions,
};

/// 工厂级配置：客户端与服务端两个方向的管道参数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryTransportOptions {
    pub client: PipeOptions,
    pub server: PipeOptions,
}

impl MemoryTransportOptions {
    pub fn with_client(mut self, client: PipeOptions) -> Self {
        self.client = client;
        self
    }

    pub fn with_server(mut self, server: PipeOptions) -> Self {
        self.server = server;
        self
    }
}

struct PendingConnect {
    client: Endpoint,
    reply: oneshot::Sender<Result<MemoryConnection>>,
}

#[derive(Default)]
struct Registry {
    listeners: DashMap<Endpoint, mpsc::UnboundedSender<PendingConnect>>,
    next_id: AtomicU64,
}

impl Registry {
    fn allocate(&self) -> Endpoint {
        Endpoint::Anonymous(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// 内存连接工厂。克隆共享同一注册表。
#[derive(Clone, Default)]
pub struct MemoryConnectionFactory {
    registry: Arc<Registry>,
    options: MemoryTransportOptions,
}

impl MemoryConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MemoryTransportOptions) -> Self {
        Self {
            registry: Arc::default(),
            options,
        }
    }

    pub fn options(&self) -> &MemoryTransportOptions {
        &self.options
    }

    /// 当前注册的监听器数量。
    pub fn listener_count(&self) -> usize {
        self.registry.listeners.len()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<BoxConnection> {
        cancel.check(error::CONNECT)?;
        let sender = self
            .registry
            .listeners
            .get(endpoint)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| refused(endpoint))?;

        let (reply, mut response) = oneshot::channel();
        let request = PendingConnect {
            client: self.registry.allocate(),
            reply,
        };
        sender.send(request).map_err(|_| refused(endpoint))?;
        debug!(endpoint = %endpoint, "memory connect queued");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // 接入方可能已经交付了连接：关闭应答端后取出它并释放，对端随即读到 EOF。
                response.close();
                if let Ok(Ok(connection)) = response.try_recv() {
                    warn!(endpoint = %endpoint, "connect cancelled after accept; releasing client half");
                    if let Err(err) = connection.dispose().await {
                        warn!(endpoint = %endpoint, error = %err, "failed to release cancelled connection");
                    }
                }
                Err(ConnectionError::cancelled(error::CONNECT))
            }
            outcome = &mut response => match outcome {
                Ok(Ok(connection)) => Ok(Box::new(connection) as BoxConnection),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(listener_closed(endpoint)),
            },
        }
    }

    async fn listen(
        &self,
        endpoint: Option<&Endpoint>,
        _options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<BoxListener> {
        cancel.check(error::LISTEN)?;
        let endpoint = match endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self.registry.allocate(),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        match self.registry.listeners.entry(endpoint.clone()) {
            Entry::Occupied(_) => {
                return Err(ConnectionError::new(
                    ErrorKind::AddressInUse,
                    ADDRESS_IN_USE,
                    format!("{}: {endpoint} is already registered", error::LISTEN.message),
                ));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(sender);
            }
        }
        debug!(endpoint = %endpoint, "memory listener registered");

        Ok(Box::new(MemoryConnectionListener {
            endpoint,
            registry: Arc::clone(&self.registry),
            options: self.options,
            receiver: AsyncMutex::new(receiver),
            lifecycle: Lifecycle::new(),
        }))
    }
}

/// 内存监听器。
pub struct MemoryConnectionListener {
    endpoint: Endpoint,
    registry: Arc<Registry>,
    options: MemoryTransportOptions,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<PendingConnect>>,
    lifecycle: Lifecycle,
}

#[async_trait]
impl ConnectionListener for MemoryConnectionListener {
    fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn accept(
        &self,
        _options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<Option<BoxConnection>> {
        if !self.lifecycle.is_active() {
            return Ok(None);
        }
        let mut receiver = tokio::select! {
            biased;
            _ = self.lifecycle.closed() => return Ok(None),
            _ = cancel.cancelled() => return Err(ConnectionError::cancelled(error::ACCEPT)),
            guard = self.receiver.lock() => guard,
        };

        loop {
            let request = tokio::select! {
                biased;
                _ = self.lifecycle.closed() => return Ok(None),
                _ = cancel.cancelled() => return Err(ConnectionError::cancelled(error::ACCEPT)),
                request = receiver.recv() => request,
            };
            let Some(PendingConnect { client, reply }) = request else {
                return Ok(None);
            };

            let (client, server) = MemoryConnection::pair(
                client,
                self.options.client,
                self.endpoint.clone(),
                self.options.server,
            );
            match reply.send(Ok(client)) {
                Ok(()) => {
                    debug!(endpoint = %self.endpoint, remote = ?server.remote_endpoint(), "memory connection accepted");
                    return Ok(Some(Box::new(server)));
                }
                Err(orphan) => {
                    warn!(
                        endpoint = %self.endpoint,
                        "connect request abandoned before accept; discarding connection"
                    );
                    if let Ok(client) = orphan {
                        let _ = client.dispose().await;
                    }
                    let _ = server.dispose().await;
                }
            }
        }
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                self.registry.listeners.remove(&self.endpoint);
                let mut receiver = self.receiver.lock().await;
                receiver.close();
                let mut failed = 0usize;
                while let Ok(pending) = receiver.try_recv() {
                    failed += 1;
                    let _ = pending.reply.send(Err(listener_closed(&self.endpoint)));
                }
                debug!(endpoint = %self.endpoint, failed, "memory listener disposed");
                Ok(())
            })
            .await
    }
}

fn refused(endpoint: &Endpoint) -> ConnectionError {
    ConnectionError::new(
        ErrorKind::Connectivity,
        CONNECTION_REFUSED,
        format!("{}: no listener at {endpoint}", error::CONNECT.message),
    )
}

fn listener_closed(endpoint: &Endpoint) -> ConnectionError {
    ConnectionError::new(
        ErrorKind::Connectivity,
        LISTENER_CLOSED,
        format!("{}: listener at {endpoint} closed", error::CONNECT.message),
    )
}
