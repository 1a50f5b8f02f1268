//! # filter 模块说明
//!
//! ## 角色定位（Why）
//! - TLS、写缓冲与故障注入都是 `Connection → Connection'` 的窄变换，
//!   以装饰器链在调用点组合，避免组合爆炸的类型层级；
//! - 每层装饰器独占其包装的基础对象，所有权呈严格树状，不存在环。
//!
//! ## 组成（What）
//! - [`ConnectionFilter`]：装饰器只需实现连接、监听、接入三个钩子；
//! - [`FilteringConnectionFactory`] / [`FilteringConnectionListener`]：通用的包装与委托；
//! - [`FilteringConnection`]：可覆盖流与扩展能力的连接包装，未覆盖的能力查询转发给基础连接。
//!
//! ## 释放顺序
//! 先释放本层获取的资源（覆盖流），再释放基础连接，与获取顺序相反；每一步都会执行。

use std::{
    any::{Any, TypeId},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    cancellation::Cancellation,
    connection::{BoxConnection, BoxFactory, BoxListener, Connection, ConnectionFactory, ConnectionListener},
    endpoint::Endpoint,
    error::Result,
    lifecycle::{Lifecycle, Teardown},
    properties::{ConnectionProperties, Extensions},
    stream::SharedStream,
};

/// 连接装饰器钩子。
///
/// # 契约说明（What）
/// - `prepare_connect`/`prepare_listen` 在调用基础工厂之前执行，用于尽早校验必需配置；
/// - `on_connect`/`on_accept` 接管基础连接的所有权；失败时必须先释放基础连接再返回错误。
#[async_trait]
pub trait ConnectionFilter: Send + Sync + 'static {
    /// 出站连接在基础连接建立前解析出的状态。
    type ConnectState: Send;
    /// 每个监听器共享的状态。
    type ListenState: Send + Sync + 'static;

    /// 日志中使用的装饰器名称。
    fn name(&self) -> &'static str;

    fn prepare_connect(
        &self,
        endpoint: &Endpoint,
        options: Option<&ConnectionProperties>,
    ) -> Result<Self::ConnectState>;

    fn prepare_listen(&self, options: Option<&ConnectionProperties>) -> Result<Self::ListenState>;

    async fn on_connect(
        &self,
        state: Self::ConnectState,
        base: BoxConnection,
        cancel: &Cancellation,
    ) -> Result<BoxConnection>;

    async fn on_accept(
        &self,
        state: &Self::ListenState,
        base: BoxConnection,
        cancel: &Cancellation,
    ) -> Result<BoxConnection>;
}

/// 包装基础工厂并对每条连接应用过滤器。
pub struct FilteringConnectionFactory<F> {
    base: BoxFactory,
    filter: Arc<F>,
}

impl<F: ConnectionFilter> FilteringConnectionFactory<F> {
    pub fn new(base: BoxFactory, filter: F) -> Self {
        Self {
            base,
            filter: Arc::new(filter),
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn base(&self) -> &dyn ConnectionFactory {
        self.base.as_ref()
    }
}

#[async_trait]
impl<F: ConnectionFilter> ConnectionFactory for FilteringConnectionFactory<F> {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<BoxConnection> {
        let state = self.filter.prepare_connect(endpoint, options)?;
        let base = self.base.connect(endpoint, options, cancel).await?;
        debug!(filter = self.filter.name(), endpoint = %endpoint, "applying connect filter");
        self.filter.on_connect(state, base, cancel).await
    }

    async fn listen(
        &self,
        endpoint: Option<&Endpoint>,
        options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<BoxListener> {
        let state = self.filter.prepare_listen(options)?;
        let base = self.base.listen(endpoint, options, cancel).await?;
        Ok(Box::new(FilteringConnectionListener {
            base,
            filter: Arc::clone(&self.filter),
            state,
        }))
    }

    async fn dispose(&self) -> Result<()> {
        self.base.dispose().await
    }
}

/// 对每个接入连接应用过滤器的监听器。
pub struct FilteringConnectionListener<F: ConnectionFilter> {
    base: BoxListener,
    filter: Arc<F>,
    state: F::ListenState,
}

#[async_trait]
impl<F: ConnectionFilter> ConnectionListener for FilteringConnectionListener<F> {
    fn local_endpoint(&self) -> &Endpoint {
        self.base.local_endpoint()
    }

    async fn accept(
        &self,
        options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<Option<BoxConnection>> {
        let Some(base) = self.base.accept(options, cancel).await? else {
            return Ok(None);
        };
        self.filter
            .on_accept(&self.state, base, cancel)
            .await
            .map(Some)
    }

    async fn dispose(&self) -> Result<()> {
        self.base.dispose().await
    }
}

/// 通用连接包装。
///
/// - 可选的覆盖流替代基础连接的流暴露给调用方；
/// - 扩展能力先查本层 [`Extensions`]，未命中再转发给基础连接，实现跨装饰器链的传递查询。
pub struct FilteringConnection {
    base: BoxConnection,
    stream: Option<SharedStream>,
    extensions: Extensions,
    lifecycle: Lifecycle,
}

impl FilteringConnection {
    pub fn new(base: BoxConnection) -> Self {
        Self {
            base,
            stream: None,
            extensions: Extensions::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn with_stream(mut self, stream: SharedStream) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// 被包装的基础连接。
    pub fn base(&self) -> &dyn Connection {
        self.base.as_ref()
    }
}

#[async_trait]
impl Connection for FilteringConnection {
    fn local_endpoint(&self) -> Option<&Endpoint> {
        self.base.local_endpoint()
    }

    fn remote_endpoint(&self) -> Option<&Endpoint> {
        self.base.remote_endpoint()
    }

    fn stream(&self) -> Result<&SharedStream> {
        self.lifecycle.ensure_active("filtering connection")?;
        match &self.stream {
            Some(stream) => Ok(stream),
            None => self.base.stream(),
        }
    }

    fn property(&self, key: TypeId) -> Option<&(dyn Any + Send + Sync)> {
        self.extensions
            .get_raw(key)
            .or_else(|| self.base.property(key))
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                let mut teardown = Teardown::new("filtering connection");
                if let Some(stream) = &self.stream {
                    teardown.record(stream.dispose().await);
                }
                teardown.record(self.base.dispose().await);
                debug!(remote = ?self.base.remote_endpoint(), "filtering connection disposed");
                teardown.finish()
            })
            .await
    }
}
