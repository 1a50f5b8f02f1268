//! 内存注册表：地址冲突、连接拒绝、监听器关闭与取消语义。

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tether_core::{Cancellation, ConnectionFactory, Endpoint, ErrorKind, FlushType};
use tether_memory::{MemoryConnectionFactory, MemoryTransportOptions, PipeOptions, error};
use tracing_test::traced_test;

#[tokio::test(flavor = "multi_thread")]
async fn second_listen_on_same_address_fails() -> Result<()> {
    let factory = MemoryConnectionFactory::new();
    let cancel = Cancellation::new();
    let address = Endpoint::named("collide");

    let first = factory.listen(Some(&address), None, &cancel).await?;
    let err = match factory.listen(Some(&address), None, &cancel).await {
        Ok(_) => anyhow::bail!("second listen must fail"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::AddressInUse);

    // 第一个监听器仍然可用。
    let connector = {
        let factory = factory.clone();
        let address = address.clone();
        tokio::spawn(async move { factory.connect(&address, None, &Cancellation::new()).await })
    };
    let accepted = first.accept(None, &cancel).await?.expect("connection");
    let client = connector.await??;
    assert_eq!(accepted.local_endpoint(), Some(&address));
    assert_eq!(client.remote_endpoint(), Some(&address));

    first.dispose().await?;
    assert_eq!(factory.listener_count(), 0);
    // 释放后地址可再次注册。
    let again = factory.listen(Some(&address), None, &cancel).await?;
    again.dispose().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_without_listener_is_refused() {
    let factory = MemoryConnectionFactory::new();
    let err = factory
        .connect(&Endpoint::named("nobody"), None, &Cancellation::new())
        .await
        .err()
        .expect("refused");
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert_eq!(err.code(), error::CONNECTION_REFUSED);
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_dispose_fails_pending_connects_and_releases_accepts() -> Result<()> {
    let factory = MemoryConnectionFactory::new();
    let address = Endpoint::named("shutdown");
    let listener = Arc::new(factory.listen(Some(&address), None, &Cancellation::new()).await?);

    let pending = {
        let factory = factory.clone();
        let address = address.clone();
        tokio::spawn(async move { factory.connect(&address, None, &Cancellation::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    listener.dispose().await?;

    let err = pending.await?.err().expect("pending connect fails");
    assert_eq!(err.kind(), ErrorKind::Connectivity);

    let waiting = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept(None, &Cancellation::new()).await })
    };
    assert!(waiting.await??.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn in_flight_accept_returns_none_on_dispose() -> Result<()> {
    let factory = MemoryConnectionFactory::new();
    let listener = Arc::new(factory.listen(None, None, &Cancellation::new()).await?);
    assert!(matches!(listener.local_endpoint(), Endpoint::Anonymous(_)));

    let waiting = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept(None, &Cancellation::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    listener.dispose().await?;
    assert!(waiting.await??.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_accept_keeps_listener_alive() -> Result<()> {
    let factory = MemoryConnectionFactory::new();
    let address = Endpoint::named("cancel-accept");
    let listener = factory.listen(Some(&address), None, &Cancellation::new()).await?;

    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = listener.accept(None, &cancel).await.err().expect("cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let connector = {
        let factory = factory.clone();
        let address = address.clone();
        tokio::spawn(async move { factory.connect(&address, None, &Cancellation::new()).await })
    };
    assert!(listener.accept(None, &Cancellation::new()).await?.is_some());
    connector.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn abandoned_connect_is_skipped_by_accept() -> Result<()> {
    let factory = MemoryConnectionFactory::new();
    let address = Endpoint::named("orphan");
    let listener = factory.listen(Some(&address), None, &Cancellation::new()).await?;

    let abandoned = Cancellation::new();
    let abandon = {
        let factory = factory.clone();
        let address = address.clone();
        let cancel = abandoned.clone();
        tokio::spawn(async move { factory.connect(&address, None, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    abandoned.cancel();
    let err = abandon.await?.err().expect("connect cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let live = {
        let factory = factory.clone();
        let address = address.clone();
        tokio::spawn(async move { factory.connect(&address, None, &Cancellation::new()).await })
    };
    let server = listener.accept(None, &Cancellation::new()).await?.expect("live connection");
    let client = live.await??;

    let cancel = Cancellation::new();
    client
        .stream()?
        .write(b"ping", FlushType::FlushWrites, &cancel)
        .await?;
    let mut buf = [0u8; 4];
    let n = server.stream()?.read(&mut buf, &cancel).await?;
    assert_eq!(&buf[..n], b"ping");
    assert!(logs_contain("connect request abandoned"));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn connect_cancelled_after_accept_releases_client_half() -> Result<()> {
    let factory = MemoryConnectionFactory::new();
    let address = Endpoint::named("late-cancel");
    let listener = factory.listen(Some(&address), None, &Cancellation::new()).await?;

    let cancel = Cancellation::new();
    let connector = {
        let factory = factory.clone();
        let address = address.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { factory.connect(&address, None, &cancel).await })
    };
    // 单线程运行时：接入完成后连接任务尚未被再次轮询，取消先于应答被观察到。
    let server = listener
        .accept(None, &Cancellation::new())
        .await?
        .expect("queued connect");
    cancel.cancel();
    let err = connector.await?.err().expect("connect cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let mut buf = [0u8; 4];
    let read = tokio::time::timeout(
        Duration::from_secs(5),
        server.stream()?.read(&mut buf, &Cancellation::new()),
    )
    .await??;
    assert_eq!(read, 0, "client half must be released");
    server.dispose().await?;
    listener.dispose().await?;
    Ok(())
}

#[test]
fn options_load_from_toml() -> Result<()> {
    let options: MemoryTransportOptions = toml::from_str(
        r#"
        [client]
        segment_size = 512

        [server]
        pause_writer_threshold = 1024
        "#,
    )?;
    assert_eq!(options.client.segment_size, 512);
    assert_eq!(
        options.client.pause_writer_threshold,
        Some(PipeOptions::DEFAULT_PAUSE_WRITER_THRESHOLD)
    );
    assert_eq!(options.server.segment_size, PipeOptions::DEFAULT_SEGMENT_SIZE);
    assert_eq!(options.server.pause_writer_threshold, Some(1024));
    Ok(())
}
