//! 通用装饰器的委托、能力传递与释放顺序。

use std::{
    any::{Any, TypeId},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::{
    BoxConnection, Cancellation, Connection, ConnectionError, EnhancedStream, Endpoint, ErrorKind,
    Extensions, FilteringConnection, FlushType, Lifecycle, Result, SharedStream,
};
use tracing_test::traced_test;

type Journal = Arc<Mutex<Vec<&'static str>>>;

struct JournalStream {
    name: &'static str,
    journal: Journal,
}

#[async_trait]
impl EnhancedStream for JournalStream {
    fn can_shutdown_writes(&self) -> bool {
        false
    }

    async fn read(&self, _buf: &mut [u8], _cancel: &Cancellation) -> Result<usize> {
        Ok(0)
    }

    async fn write(&self, _buf: &[u8], _flush: FlushType, _cancel: &Cancellation) -> Result<()> {
        Ok(())
    }

    async fn flush(&self, _flush: FlushType, _cancel: &Cancellation) -> Result<()> {
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.journal.lock().push(self.name);
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
struct BaseMarker(u8);

#[derive(Debug, PartialEq)]
struct LayerMarker(u8);

struct StubConnection {
    remote: Endpoint,
    stream: SharedStream,
    extensions: Extensions,
    journal: Journal,
    disposals: Arc<AtomicUsize>,
    fail_dispose: bool,
    lifecycle: Lifecycle,
}

#[async_trait]
impl Connection for StubConnection {
    fn local_endpoint(&self) -> Option<&Endpoint> {
        None
    }

    fn remote_endpoint(&self) -> Option<&Endpoint> {
        Some(&self.remote)
    }

    fn stream(&self) -> Result<&SharedStream> {
        self.lifecycle.ensure_active("stub connection")?;
        Ok(&self.stream)
    }

    fn property(&self, key: TypeId) -> Option<&(dyn Any + Send + Sync)> {
        self.extensions.get_raw(key)
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                self.disposals.fetch_add(1, Ordering::SeqCst);
                self.journal.lock().push("base");
                if self.fail_dispose {
                    Err(ConnectionError::new(
                        ErrorKind::Connectivity,
                        "tether.test.base_dispose_failed",
                        "base dispose failed",
                    ))
                } else {
                    Ok(())
                }
            })
            .await
    }
}

fn stub(journal: &Journal, disposals: &Arc<AtomicUsize>, fail_dispose: bool) -> BoxConnection {
    Box::new(StubConnection {
        remote: Endpoint::named("peer"),
        stream: Arc::new(JournalStream {
            name: "base-stream",
            journal: Arc::clone(journal),
        }),
        extensions: Extensions::new().with(BaseMarker(1)),
        journal: Arc::clone(journal),
        disposals: Arc::clone(disposals),
        fail_dispose,
        lifecycle: Lifecycle::new(),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn properties_fall_through_to_base() {
    let journal = Journal::default();
    let disposals = Arc::new(AtomicUsize::new(0));
    let conn: BoxConnection = Box::new(
        FilteringConnection::new(stub(&journal, &disposals, false))
            .with_extensions(Extensions::new().with(LayerMarker(2))),
    );

    assert_eq!(conn.try_get_property::<LayerMarker>(), Some(&LayerMarker(2)));
    assert_eq!(conn.try_get_property::<BaseMarker>(), Some(&BaseMarker(1)));
    assert!(conn.try_get_property::<String>().is_none());
    assert_eq!(conn.remote_endpoint(), Some(&Endpoint::named("peer")));
}

#[tokio::test(flavor = "multi_thread")]
async fn dispose_releases_own_stream_before_base_once() {
    let journal = Journal::default();
    let disposals = Arc::new(AtomicUsize::new(0));
    let layer_stream: SharedStream = Arc::new(JournalStream {
        name: "layer-stream",
        journal: Arc::clone(&journal),
    });
    let conn = Arc::new(
        FilteringConnection::new(stub(&journal, &disposals, false)).with_stream(layer_stream),
    );

    let racers: Vec<_> = (0..4)
        .map(|_| {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.dispose().await })
        })
        .collect();
    for racer in racers {
        racer.await.expect("join").expect("dispose");
    }

    assert_eq!(disposals.load(Ordering::SeqCst), 1);
    assert_eq!(journal.lock().as_slice(), &["layer-stream", "base"]);
    let err = conn.stream().err().expect("stream unavailable after dispose");
    assert_eq!(err.kind(), ErrorKind::Disposed);
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn base_dispose_failure_is_reported() {
    let journal = Journal::default();
    let disposals = Arc::new(AtomicUsize::new(0));
    let conn = FilteringConnection::new(stub(&journal, &disposals, true));

    let err = conn.dispose().await.expect_err("base failure propagates");
    assert_eq!(err.code(), "tether.test.base_dispose_failed");
    assert!(logs_contain("teardown failed"));

    conn.dispose().await.expect("second dispose is a no-op");
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
}
