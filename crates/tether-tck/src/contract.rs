//! 连接抽象的契约断言。
//!
//! # 教案式说明
//! - **意图（Why）**：同一组断言在内存管道、OS 套接字、TLS 与各类装饰器上运行，
//!   任何实现偏离契约都会在这里以统一的失败信号暴露；
//! - **约定（What）**：每个断言自行创建并释放监听器与连接，调用方只需在 Tokio 多线程运行时内执行；
//! - **权衡（Trade-offs）**：等待类断言使用短暂的 `sleep` 让在途操作先挂起，
//!   时间窗口只影响覆盖的时序而不影响断言结论。

use std::{io::IoSlice, time::Duration};

use anyhow::{Context, anyhow, ensure};
use tether_core::{Cancellation, ErrorKind, FlushType};
use tracing::debug;

use crate::fixture::{TransportFixture, read_exact, read_to_end};

/// 往返收发与半关闭。
///
/// - 客户端发送 `ping` 并刷新，服务端精确读取后回复 `pong`；
/// - 支持半关闭时：客户端以 `FlushAndShutdownWrites` 发送尾部数据，服务端读到 EOF 后仍能回写，
///   客户端照常读取；
/// - 不支持时：`FlushAndShutdownWrites` 必须返回 `Unsupported`。
pub async fn assert_round_trip_and_half_close(fixture: &TransportFixture) -> anyhow::Result<()> {
    let listener = fixture.listen().await.context("listen")?;
    let (client, server) = fixture.pair(&listener).await?;
    let cancel = Cancellation::new();
    let client_stream = client.stream().context("client stream")?.clone();
    let server_stream = server.stream().context("server stream")?.clone();

    client_stream
        .write(b"ping", FlushType::FlushWrites, &cancel)
        .await
        .context("client write")?;
    ensure!(read_exact(&server_stream, 4).await? == b"ping", "server received wrong payload");

    server_stream
        .write(b"pong", FlushType::FlushWrites, &cancel)
        .await
        .context("server write")?;
    ensure!(read_exact(&client_stream, 4).await? == b"pong", "client received wrong payload");

    let shutdown = client_stream
        .write(b"tail", FlushType::FlushAndShutdownWrites, &cancel)
        .await;
    if fixture.supports_half_close() {
        shutdown.context("client half close")?;
        ensure!(read_to_end(&server_stream).await? == b"tail", "server missed tail");
        let mut eof = [0u8; 8];
        ensure!(
            server_stream.read(&mut eof, &cancel).await? == 0,
            "eof must be sticky"
        );

        server_stream
            .write(b"after-eof", FlushType::FlushWrites, &cancel)
            .await
            .context("server write after peer half close")?;
        ensure!(
            read_exact(&client_stream, 9).await? == b"after-eof",
            "client must keep reading after shutting down writes"
        );
        let late = client_stream.write(b"late", FlushType::None, &cancel).await;
        ensure!(
            matches!(late.as_ref().map_err(|err| err.kind()), Err(ErrorKind::InvalidState)),
            "write after shutdown must be rejected: {late:?}"
        );
    } else {
        let err = shutdown
            .err()
            .ok_or_else(|| anyhow!("half close must be rejected"))?;
        ensure!(err.kind() == ErrorKind::Unsupported, "unexpected error: {err}");
    }

    client.dispose().await.context("dispose client")?;
    server.dispose().await.context("dispose server")?;
    listener.dispose().await.context("dispose listener")?;
    debug!(transport = fixture.name(), "round trip contract satisfied");
    Ok(())
}

/// 多缓冲写入：对端按顺序收到所有缓冲拼接后的字节，空缓冲被跳过。
pub async fn assert_multi_buffer_write(fixture: &TransportFixture) -> anyhow::Result<()> {
    let listener = fixture.listen().await.context("listen")?;
    let (client, server) = fixture.pair(&listener).await?;
    let cancel = Cancellation::new();
    let client_stream = client.stream().context("client stream")?.clone();
    let server_stream = server.stream().context("server stream")?.clone();

    let large: Vec<u8> = (0..20 * 1024).map(|i| (i % 251) as u8).collect();
    let parts: [&[u8]; 5] = [b"hea", b"", b"der", &large, b"!"];
    let expected: Vec<u8> = parts.concat();

    let bufs: Vec<IoSlice<'_>> = parts.iter().map(|part| IoSlice::new(part)).collect();
    let (written, received) = tokio::join!(
        client_stream.write_vectored(&bufs, FlushType::FlushWrites, &cancel),
        read_exact(&server_stream, expected.len()),
    );
    written.context("vectored write")?;
    ensure!(received? == expected, "payload reordered or truncated");

    client.dispose().await.context("dispose client")?;
    server.dispose().await.context("dispose server")?;
    listener.dispose().await.context("dispose listener")?;
    Ok(())
}

/// 监听器关闭：在途与后续 `accept` 返回 `Ok(None)`，重复释放成功，随后的连接失败。
pub async fn assert_listener_shutdown(fixture: &TransportFixture) -> anyhow::Result<()> {
    let listener = fixture.listen().await.context("listen")?;
    let target = listener.local_endpoint().clone();
    let cancel = Cancellation::new();

    let (accepted, disposed) = tokio::join!(listener.accept(None, &cancel), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.dispose().await
    });
    disposed.context("dispose listener")?;
    ensure!(
        accepted.context("in-flight accept")?.is_none(),
        "in-flight accept must observe shutdown"
    );
    ensure!(
        listener.accept(None, &cancel).await?.is_none(),
        "accept after dispose must return none"
    );
    listener.dispose().await.context("second dispose")?;

    let late = fixture.connect(&target).await;
    ensure!(late.is_err(), "connect to a disposed listener must fail");
    Ok(())
}

/// 地址冲突：在已占用的地址上再次监听返回 `AddressInUse`，第一个监听器不受影响。
pub async fn assert_address_collision(fixture: &TransportFixture) -> anyhow::Result<()> {
    let listener = fixture.listen().await.context("listen")?;
    let occupied = listener.local_endpoint().clone();

    let err = fixture
        .listen_on(Some(&occupied))
        .await
        .err()
        .ok_or_else(|| anyhow!("second listener on {occupied} must fail"))?;
    ensure!(err.kind() == ErrorKind::AddressInUse, "unexpected error: {err}");

    let (client, server) = fixture.pair(&listener).await?;
    client.dispose().await?;
    server.dispose().await?;
    listener.dispose().await?;
    Ok(())
}

/// 单次 `accept` 的取消返回 `Cancelled`，监听器保持可用。
pub async fn assert_cancelled_accept_keeps_listener(
    fixture: &TransportFixture,
) -> anyhow::Result<()> {
    let listener = fixture.listen().await.context("listen")?;

    let cancel = Cancellation::new();
    let (accepted, _) = tokio::join!(listener.accept(None, &cancel), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel()
    });
    let err = accepted
        .err()
        .ok_or_else(|| anyhow!("cancelled accept must fail"))?;
    ensure!(err.kind() == ErrorKind::Cancelled, "unexpected error: {err}");

    let (client, server) = fixture.pair(&listener).await?;
    client.dispose().await?;
    server.dispose().await?;
    listener.dispose().await?;
    Ok(())
}

/// 并发释放连接：所有调用都成功返回，释放后取流得到 `Disposed`，对端读到 EOF 或连接错误。
pub async fn assert_concurrent_dispose(fixture: &TransportFixture) -> anyhow::Result<()> {
    let listener = fixture.listen().await.context("listen")?;
    let (client, server) = fixture.pair(&listener).await?;
    let server_stream = server.stream().context("server stream")?.clone();

    let (first, second, third) =
        tokio::join!(client.dispose(), client.dispose(), client.dispose());
    first.context("first dispose")?;
    second.context("second dispose")?;
    third.context("third dispose")?;
    ensure!(
        matches!(client.stream().map(|_| ()).map_err(|err| err.kind()), Err(ErrorKind::Disposed)),
        "stream after dispose must report disposed"
    );

    let mut buf = [0u8; 8];
    match server_stream.read(&mut buf, &Cancellation::new()).await {
        Ok(read) => ensure!(read == 0, "peer must observe eof"),
        Err(err) => ensure!(err.kind() == ErrorKind::Connectivity, "unexpected error: {err}"),
    }

    server.dispose().await?;
    listener.dispose().await?;
    Ok(())
}

/// 取消的写入不会重复：返回 `Cancelled` 的写入没有任何字节到达对端。
///
/// - 客户端先写入大块前置数据，在对端开始读取之前再以令牌 `T` 写入一段数据 `A`；
/// - 约 100ms 后取消 `T`，对端随即读走前置数据；
/// - `A` 只能整体成功或以 `Cancelled` 失败，随后写入的标记 `B` 紧跟在实际接受的字节之后，
///   对端收到的内容必须恰好是 `A`（若成功）加 `B`。
pub async fn assert_cancelled_write_does_not_duplicate(
    fixture: &TransportFixture,
) -> anyhow::Result<()> {
    let listener = fixture.listen().await.context("listen")?;
    let (client, server) = fixture.pair(&listener).await?;
    let client_stream = client.stream().context("client stream")?.clone();
    let server_stream = server.stream().context("server stream")?.clone();

    let prefill: Vec<u8> = (0..128 * 1024).map(|i| (i % 253) as u8).collect();
    let attempt: Vec<u8> = (0..4 * 1024).map(|i| (i % 7) as u8 + b'a').collect();
    let marker = b"<end-of-stream>";
    let token = Cancellation::new();

    let (outcome, drained) = tokio::join!(
        async {
            client_stream
                .write(&prefill, FlushType::FlushWrites, &Cancellation::new())
                .await
                .context("prefill write")?;
            anyhow::Ok(
                client_stream
                    .write(&attempt, FlushType::FlushWrites, &token)
                    .await,
            )
        },
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
            read_exact(&server_stream, prefill.len()).await
        }
    );
    ensure!(drained? == prefill, "prefill reordered or truncated");

    let mut expected = Vec::new();
    match outcome? {
        Ok(()) => expected.extend_from_slice(&attempt),
        Err(err) => ensure!(err.kind() == ErrorKind::Cancelled, "unexpected error: {err}"),
    }
    expected.extend_from_slice(marker);

    let marker_cancel = Cancellation::new();
    let (written, received) = tokio::join!(
        client_stream.write(marker, FlushType::FlushWrites, &marker_cancel),
        read_exact(&server_stream, expected.len())
    );
    written.context("marker write")?;
    ensure!(
        received? == expected,
        "bytes of a cancelled write reached the peer"
    );

    client.dispose().await.context("dispose client")?;
    server.dispose().await.context("dispose server")?;
    listener.dispose().await.context("dispose listener")?;
    Ok(())
}

/// 接入完成后才取消的连接不会泄漏客户端：连接要么以 `Cancelled` 失败并释放客户端，
/// 要么已经成功返回；两种情况下服务端最终都读到 EOF 或连接错误，而不是永远挂起。
pub async fn assert_cancelled_connect_releases_peer(
    fixture: &TransportFixture,
) -> anyhow::Result<()> {
    let listener = fixture.listen().await.context("listen")?;
    let target = listener.local_endpoint().clone();
    let cancel = Cancellation::new();

    let (connected, accepted) = tokio::join!(fixture.connect_with(&target, &cancel), async {
        let accepted = listener.accept(None, &Cancellation::new()).await;
        cancel.cancel();
        accepted
    });
    let server = accepted
        .context("accept")?
        .ok_or_else(|| anyhow!("listener closed while accepting"))?;
    match connected {
        Ok(client) => client.dispose().await.context("dispose client")?,
        Err(err) => ensure!(err.kind() == ErrorKind::Cancelled, "unexpected error: {err}"),
    }

    let server_stream = server.stream().context("server stream")?.clone();
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(
        Duration::from_secs(5),
        server_stream.read(&mut buf, &Cancellation::new()),
    )
    .await
    .map_err(|_| anyhow!("peer of a cancelled connect never observed the release"))?;
    match read {
        Ok(read) => ensure!(read == 0, "peer must observe eof"),
        Err(err) => ensure!(err.kind() == ErrorKind::Connectivity, "unexpected error: {err}"),
    }

    server.dispose().await?;
    listener.dispose().await?;
    Ok(())
}

/// 依次运行全部契约断言。
pub async fn assert_all(fixture: &TransportFixture) -> anyhow::Result<()> {
    assert_round_trip_and_half_close(fixture)
        .await
        .with_context(|| format!("[{}] round trip", fixture.name()))?;
    assert_multi_buffer_write(fixture)
        .await
        .with_context(|| format!("[{}] multi-buffer write", fixture.name()))?;
    assert_listener_shutdown(fixture)
        .await
        .with_context(|| format!("[{}] listener shutdown", fixture.name()))?;
    assert_address_collision(fixture)
        .await
        .with_context(|| format!("[{}] address collision", fixture.name()))?;
    assert_cancelled_accept_keeps_listener(fixture)
        .await
        .with_context(|| format!("[{}] cancelled accept", fixture.name()))?;
    assert_concurrent_dispose(fixture)
        .await
        .with_context(|| format!("[{}] concurrent dispose", fixture.name()))?;
    assert_cancelled_write_does_not_duplicate(fixture)
        .await
        .with_context(|| format!("[{}] cancelled write", fixture.name()))?;
    assert_cancelled_connect_releases_peer(fixture)
        .await
        .with_context(|| format!("[{}] cancelled connect", fixture.name()))?;
    Ok(())
}
