//! 被测传输的描述与建连辅助。

use std::sync::Arc;

use anyhow::{Context, anyhow};
use tether_core::{
    BoxConnection, BoxListener, Cancellation, ConnectionFactory, ConnectionProperties, Endpoint,
    Result as ConnectionResult, SharedStream,
};

/// 一个被测传输。
///
/// # 契约（What）
/// - `factory`：连接与监听共用的工厂，内存传输依赖它共享注册表；
/// - `listen_at`：缺省时由传输自行分配地址；
/// - 能力包在每次调用时克隆，冻结状态不会在用例之间传递；
/// - `half_close` 为 `false` 时，断言期望 `FlushAndShutdownWrites` 返回 `Unsupported`。
#[derive(Clone)]
pub struct TransportFixture {
    name: &'static str,
    factory: Arc<dyn ConnectionFactory>,
    listen_at: Option<Endpoint>,
    connect_options: Option<ConnectionProperties>,
    listen_options: Option<ConnectionProperties>,
    half_close: bool,
}

impl TransportFixture {
    pub fn new(name: &'static str, factory: impl ConnectionFactory + 'static) -> Self {
        Self {
            name,
            factory: Arc::new(factory),
            listen_at: None,
            connect_options: None,
            listen_options: None,
            half_close: true,
        }
    }

    pub fn listen_at(mut self, endpoint: Endpoint) -> Self {
        self.listen_at = Some(endpoint);
        self
    }

    pub fn with_connect_options(mut self, options: ConnectionProperties) -> Self {
        self.connect_options = Some(options);
        self
    }

    pub fn with_listen_options(mut self, options: ConnectionProperties) -> Self {
        self.listen_options = Some(options);
        self
    }

    pub fn without_half_close(mut self) -> Self {
        self.half_close = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn supports_half_close(&self) -> bool {
        self.half_close
    }

    pub fn factory(&self) -> &dyn ConnectionFactory {
        self.factory.as_ref()
    }

    /// 在夹具配置的地址上监听。
    pub async fn listen(&self) -> ConnectionResult<BoxListener> {
        self.listen_on(self.listen_at.as_ref()).await
    }

    /// 在指定地址上监听，沿用夹具的监听能力包。
    pub async fn listen_on(&self, endpoint: Option<&Endpoint>) -> ConnectionResult<BoxListener> {
        let options = self.listen_options.clone();
        self.factory
            .listen(endpoint, options.as_ref(), &Cancellation::new())
            .await
    }

    pub async fn connect(&self, target: &Endpoint) -> ConnectionResult<BoxConnection> {
        self.connect_with(target, &Cancellation::new()).await
    }

    /// 以调用方的取消令牌发起连接，沿用夹具的连接能力包。
    pub async fn connect_with(
        &self,
        target: &Endpoint,
        cancel: &Cancellation,
    ) -> ConnectionResult<BoxConnection> {
        let options = self.connect_options.clone();
        self.factory.connect(target, options.as_ref(), cancel).await
    }

    /// 并发执行连接与接入，返回 `(client, server)`。
    pub async fn pair(&self, listener: &BoxListener) -> anyhow::Result<(BoxConnection, BoxConnection)> {
        let target = listener.local_endpoint().clone();
        let cancel = Cancellation::new();
        let (client, server) = tokio::join!(self.connect(&target), listener.accept(None, &cancel));
        let client = client.with_context(|| format!("[{}] connect to {target}", self.name))?;
        let server = server
            .with_context(|| format!("[{}] accept on {target}", self.name))?
            .ok_or_else(|| anyhow!("[{}] listener closed while accepting", self.name))?;
        Ok((client, server))
    }
}

/// 精确读取 `len` 字节；提前遇到 EOF 视为失败。
pub async fn read_exact(stream: &SharedStream, len: usize) -> anyhow::Result<Vec<u8>> {
    let cancel = Cancellation::new();
    let mut received = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let read = stream
            .read(&mut received[filled..], &cancel)
            .await
            .context("read payload")?;
        if read == 0 {
            return Err(anyhow!("unexpected eof after {filled} of {len} bytes"));
        }
        filled += read;
    }
    Ok(received)
}

/// 读取直到 EOF。
pub async fn read_to_end(stream: &SharedStream) -> anyhow::Result<Vec<u8>> {
    let cancel = Cancellation::new();
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let read = stream.read(&mut buf, &cancel).await.context("read to eof")?;
        if read == 0 {
            return Ok(received);
        }
        received.extend_from_slice(&buf[..read]);
    }
}
