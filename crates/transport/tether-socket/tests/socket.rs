//! 真实 TCP 套接字上的连接、监听与取消语义。

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tether_core::{
    BoxConnection, BoxListener, Cancellation, ConnectionFactory, ConnectionProperties, Endpoint,
    ErrorKind, FlushType,
};
use tether_socket::{AddressFamily, SocketConfig, SocketConnectionFactory, SocketHandle, error};
use tracing_test::traced_test;

fn v4_factory() -> SocketConnectionFactory {
    SocketConnectionFactory::with_config(SocketConfig::default().with_family(AddressFamily::V4))
}

async fn loopback_listener(factory: &SocketConnectionFactory) -> Result<BoxListener> {
    let address = Endpoint::Ip("127.0.0.1:0".parse()?);
    Ok(factory
        .listen(Some(&address), None, &Cancellation::new())
        .await?)
}

async fn connected_pair(
    factory: &SocketConnectionFactory,
    listener: &BoxListener,
) -> Result<(BoxConnection, BoxConnection)> {
    let target = listener.local_endpoint().clone();
    let connector = {
        let factory = factory.clone();
        tokio::spawn(async move { factory.connect(&target, None, &Cancellation::new()).await })
    };
    let server = listener
        .accept(None, &Cancellation::new())
        .await?
        .ok_or_else(|| anyhow::anyhow!("listener closed"))?;
    let client = connector.await??;
    Ok((client, server))
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn wildcard_listener_accepts_loopback_connect() -> Result<()> {
    let factory = v4_factory();
    let listener = factory.listen(None, None, &Cancellation::new()).await?;
    let local = listener.local_endpoint().clone();
    assert!(local.is_unspecified_ip());

    // 连接通配地址等价于连接回环地址。
    let (client, server) = connected_pair(&factory, &listener).await?;
    let remote_port = client
        .remote_endpoint()
        .and_then(Endpoint::as_socket_addr)
        .map(|addr| addr.port());
    assert_eq!(remote_port, local.as_socket_addr().map(|addr| addr.port()));
    assert_eq!(client.local_endpoint(), server.remote_endpoint());

    client.dispose().await?;
    server.dispose().await?;
    listener.dispose().await?;
    assert!(logs_contain("socket listener bound"));
    assert!(logs_contain("socket connection accepted"));
    assert!(logs_contain("socket listener disposed"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn half_close_delivers_eof_while_reads_continue() -> Result<()> {
    let factory = v4_factory();
    let listener = loopback_listener(&factory).await?;
    let (client, server) = connected_pair(&factory, &listener).await?;
    let cancel = Cancellation::new();

    let client_stream = client.stream()?.clone();
    client_stream
        .write(b"hello", FlushType::FlushAndShutdownWrites, &cancel)
        .await?;

    let server_stream = server.stream()?.clone();
    let mut received = Vec::new();
    let mut buf = [0u8; 16];
    loop {
        let n = server_stream.read(&mut buf, &cancel).await?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"hello");
    assert_eq!(server_stream.read(&mut buf, &cancel).await?, 0);

    // 客户端写方向已关闭，但仍能读取服务端的应答。
    server_stream
        .write(b"bye", FlushType::FlushWrites, &cancel)
        .await?;
    let n = client_stream.read(&mut buf, &cancel).await?;
    assert_eq!(&buf[..n], b"bye");

    let err = client_stream
        .write(b"late", FlushType::None, &cancel)
        .await
        .err()
        .expect("writes shut down");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_accept_does_not_close_listener() -> Result<()> {
    let factory = v4_factory();
    let listener = loopback_listener(&factory).await?;

    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = listener.accept(None, &cancel).await.err().expect("cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let (client, server) = connected_pair(&factory, &listener).await?;
    client.dispose().await?;
    server.dispose().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dispose_releases_in_flight_accept() -> Result<()> {
    let factory = v4_factory();
    let listener: Arc<BoxListener> = Arc::new(loopback_listener(&factory).await?);
    let waiting = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept(None, &Cancellation::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    listener.dispose().await?;
    assert!(waiting.await??.is_none());
    assert!(listener.accept(None, &Cancellation::new()).await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn second_bind_reports_address_in_use() -> Result<()> {
    let factory = v4_factory();
    let listener = loopback_listener(&factory).await?;
    let err = factory
        .listen(Some(listener.local_endpoint()), None, &Cancellation::new())
        .await
        .err()
        .expect("address in use");
    assert_eq!(err.kind(), ErrorKind::AddressInUse);
    listener.dispose().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connect_keeps_native_code() -> Result<()> {
    let factory = v4_factory();
    let listener = loopback_listener(&factory).await?;
    let target = listener.local_endpoint().clone();
    listener.dispose().await?;

    let err = factory
        .connect(&target, None, &Cancellation::new())
        .await
        .err()
        .expect("refused");
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(err.raw_os_error().is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn named_endpoint_is_rejected() {
    let err = SocketConnectionFactory::new()
        .connect(&Endpoint::named("svc"), None, &Cancellation::new())
        .await
        .err()
        .expect("not an ip endpoint");
    assert_eq!(err.kind(), ErrorKind::Address);
    assert_eq!(err.code(), error::UNSUPPORTED_ENDPOINT);
}

#[tokio::test(flavor = "multi_thread")]
async fn socket_handle_reflects_per_call_config() -> Result<()> {
    let factory = v4_factory();
    let listener = loopback_listener(&factory).await?;
    let target = listener.local_endpoint().clone();

    let mut options = ConnectionProperties::new();
    options.add(
        SocketConfig::default()
            .with_family(AddressFamily::V4)
            .with_linger(Some(Duration::from_secs(1))),
    )?;
    let accept = tokio::spawn(async move {
        let accepted = listener.accept(None, &Cancellation::new()).await;
        (listener, accepted)
    });
    let client = factory.connect(&target, Some(&options), &Cancellation::new()).await?;
    assert!(options.is_frozen());

    let handle = client
        .try_get_property::<SocketHandle>()
        .ok_or_else(|| anyhow::anyhow!("socket handle missing"))?;
    assert_eq!(handle.linger()?, Some(Duration::from_secs(1)));

    client.dispose().await?;
    let handle = client
        .try_get_property::<SocketHandle>()
        .ok_or_else(|| anyhow::anyhow!("socket handle missing"))?;
    assert!(handle.is_closed());
    assert_eq!(handle.linger().err().map(|err| err.kind()), Some(ErrorKind::Disposed));

    let (listener, accepted) = accept.await?;
    if let Some(server) = accepted? {
        server.dispose().await?;
    }
    listener.dispose().await?;
    Ok(())
}
