//! Per-viewer websocket pumps.
//!
//! Each viewer gets a writer task draining its hub queue into the socket and a
//! reader task watching for keepalive replies. When either finishes the other
//! is aborted and the viewer is unregistered.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};

use super::Hub;

/// Keepalive and deadline settings for one viewer connection.
#[derive(Debug, Clone, Copy)]
pub struct PumpTimings {
    /// Maximum time a single frame write may take.
    pub write_timeout: Duration,
    /// Connection is closed when no pong arrives within this long.
    pub pong_wait: Duration,
    /// Interval between pings; must be shorter than `pong_wait`.
    pub ping_period: Duration,
}

impl Default for PumpTimings {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_timeout: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }
}

/// Serve one upgraded websocket until it disconnects.
pub async fn serve_viewer(socket: WebSocket, hub: Hub, timings: PumpTimings) {
    let subscription = match hub.register().await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!("Rejecting viewer: {}", e);
            return;
        }
    };
    let id = subscription.id;
    tracing::info!(viewer = id, "Viewer connected");

    let (sink, stream) = socket.split();
    run_pumps(sink, stream, subscription.receiver, timings).await;

    hub.unregister(id).await;
    tracing::info!(viewer = id, "Viewer disconnected");
}

/// Run both pumps until either finishes.
///
/// The pumps live in a set owned by this future, so they are aborted when it
/// returns or is dropped.
pub async fn run_pumps<W, R, E>(sink: W, stream: R, queue: mpsc::Receiver<Arc<str>>, timings: PumpTimings)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let mut pumps = JoinSet::new();
    pumps.spawn(write_pump(sink, queue, timings));
    pumps.spawn(read_pump(stream, timings));

    pumps.join_next().await;
    pumps.shutdown().await;
}

/// Forward queued payloads to the socket and ping on a fixed interval.
///
/// Returns when the queue closes, a write fails, or a write exceeds its deadline.
pub async fn write_pump<S>(mut sink: S, mut queue: mpsc::Receiver<Arc<str>>, timings: PumpTimings)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = tokio::time::interval_at(
        Instant::now() + timings.ping_period,
        timings.ping_period,
    );

    loop {
        let frame = tokio::select! {
            payload = queue.recv() => match payload {
                Some(payload) => Message::Text(payload.to_string().into()),
                None => {
                    let _ = timeout(timings.write_timeout, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ticker.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(timings.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Viewer write failed: {}", e);
                return;
            }
            Err(_) => {
                tracing::debug!("Viewer write timed out");
                return;
            }
        }
    }
}

/// Consume inbound frames, extending the read deadline on every pong.
///
/// Returns on close, read error, end of stream, or an expired deadline.
pub async fn read_pump<S, E>(mut stream: S, timings: PumpTimings)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + timings.pong_wait;

    loop {
        match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                tracing::debug!("Viewer missed keepalive deadline");
                return;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(Message::Pong(_)))) => {
                deadline = Instant::now() + timings.pong_wait;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                tracing::debug!("Viewer read failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    fn timings() -> PumpTimings {
        PumpTimings {
            write_timeout: Duration::from_secs(1),
            pong_wait: Duration::from_secs(6),
            ping_period: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_pump_forwards_then_closes() {
        let (sink, mut frames) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Arc::from("one")).await.unwrap();
        tx.send(Arc::from("two")).await.unwrap();
        drop(tx);

        write_pump(sink, rx, timings()).await;

        assert_eq!(frames.next().await, Some(Message::Text("one".to_string().into())));
        assert_eq!(frames.next().await, Some(Message::Text("two".to_string().into())));
        assert_eq!(frames.next().await, Some(Message::Close(None)));
        assert_eq!(frames.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_pump_pings_when_idle() {
        let (sink, mut frames) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel::<Arc<str>>(4);
        let pump = tokio::spawn(write_pump(sink, rx, timings()));

        assert_eq!(frames.next().await, Some(Message::Ping(Bytes::new())));
        drop(tx);
        pump.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_pump_stops_on_broken_sink() {
        let (sink, frames) = fmpsc::unbounded::<Message>();
        drop(frames);
        let (tx, rx) = mpsc::channel(4);
        tx.send(Arc::from("lost")).await.unwrap();

        // Returns even though the queue is still open.
        write_pump(sink, rx, timings()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_pump_times_out_without_pong() {
        let (_inbound, stream) = fmpsc::unbounded::<Result<Message, String>>();
        let start = Instant::now();

        read_pump(stream, timings()).await;
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_pump_pong_extends_deadline() {
        let (inbound, stream) = fmpsc::unbounded::<Result<Message, String>>();
        let start = Instant::now();
        let reader = tokio::spawn(read_pump(stream, timings()));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            inbound
                .unbounded_send(Ok(Message::Pong(Bytes::new())))
                .unwrap();
        }

        reader.await.unwrap();
        // Last pong at 12s, deadline 6s later.
        assert!(start.elapsed() >= Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pumps_stops_writer_when_reader_ends() {
        let (sink, mut frames) = fmpsc::unbounded::<Message>();
        let (inbound, stream) = fmpsc::unbounded::<Result<Message, String>>();
        let (tx, rx) = mpsc::channel::<Arc<str>>(4);
        inbound.unbounded_send(Ok(Message::Close(None))).unwrap();

        run_pumps(sink, stream, rx, timings()).await;

        assert!(tx.is_closed());
        assert_eq!(frames.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_run_pumps_aborts_both() {
        let (sink, mut frames) = fmpsc::unbounded::<Message>();
        let (_inbound, stream) = fmpsc::unbounded::<Result<Message, String>>();
        let (tx, rx) = mpsc::channel::<Arc<str>>(4);

        let pumps = tokio::spawn(run_pumps(sink, stream, rx, timings()));
        tokio::task::yield_now().await;
        pumps.abort();
        assert!(pumps.await.unwrap_err().is_cancelled());

        // Well before the read deadline, both halves are already gone.
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .unwrap();
        assert_eq!(frames.next().await, None);
    }

    #[tokio::test]
    async fn test_read_pump_stops_on_close_and_error() {
        let (inbound, stream) = fmpsc::unbounded::<Result<Message, String>>();
        inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        read_pump(stream, timings()).await;

        let (inbound, stream) = fmpsc::unbounded::<Result<Message, String>>();
        inbound.unbounded_send(Err("reset".to_string())).unwrap();
        read_pump(stream, timings()).await;
    }
}
