//! Flow-controlled writes over a [`Sink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, oneshot};
use tracing::trace;

use crate::cancel::Pending;
use crate::error::StreamError;
use crate::source::Sink;

const BUSY: &str = "sink is in use by another write or close";

/// Wraps a sink so writes only proceed once it signals readiness.
///
/// `write` and `close` run detached: dropping the returned [`Pending`] stops the caller
/// from being notified but lets the sink operation finish, since sinks cannot abort a
/// partial write. A write or close issued while another one is still in flight fails
/// immediately with [`StreamError::Usage`]. Readiness waits never count as a claim: a write
/// queues behind them on the sink lock.
pub struct BackpressureGate<W> {
	sink: Arc<Mutex<W>>,
	claimed: Arc<AtomicBool>,
}

/// Exclusive write/close claim, released when the operation finishes or is dropped.
struct Claim(Arc<AtomicBool>);

impl Claim {
	fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
		flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| Self(Arc::clone(flag)))
	}
}

impl Drop for Claim {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

impl<W> BackpressureGate<W>
where
	W: Sink + 'static,
{
	/// Wraps a sink.
	pub fn new(sink: W) -> Self {
		Self {
			sink: Arc::new(Mutex::new(sink)),
			claimed: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Waits for readiness, then writes `item`.
	pub fn write(&self, item: W::Item) -> Pending<()>
	where
		W::Item: 'static,
	{
		let Some(claim) = Claim::acquire(&self.claimed) else {
			return Pending::ready(Err(StreamError::Usage(BUSY)));
		};
		let sink = Arc::clone(&self.sink);
		Pending::spawn(async move {
			let _claim = claim;
			let mut sink = sink.lock().await;
			sink.ready().await.map_err(into_sink_error)?;
			sink.write(item).await.map_err(into_sink_error)
		})
	}

	/// Closes the sink.
	pub fn close(&self) -> Pending<()> {
		let Some(claim) = Claim::acquire(&self.claimed) else {
			return Pending::ready(Err(StreamError::Usage(BUSY)));
		};
		let sink = Arc::clone(&self.sink);
		Pending::spawn(async move {
			let _claim = claim;
			sink.lock().await.close().await.map_err(into_sink_error)
		})
	}

	/// Resolves once the sink has capacity.
	///
	/// Waits behind an in-flight write or close. Each call resolves independently, and a
	/// dropped `ready` stops waiting since it only observes the sink.
	pub fn ready(&self) -> Pending<()> {
		let sink = Arc::clone(&self.sink);
		let (tx, rx) = oneshot::channel();
		tokio::spawn(async move {
			let mut tx = tx;
			tokio::select! {
				_ = tx.closed() => trace!("stream.gate.ready_detached"),
				out = async { sink.lock().await.ready().await } => {
					let _ = tx.send(out.map_err(into_sink_error));
				}
			}
		});
		Pending::from_receiver(rx)
	}

	/// True while a write or close is in flight.
	pub fn is_busy(&self) -> bool {
		self.claimed.load(Ordering::Acquire)
	}
}

/// Failures coming out of a sink are sink failures, whatever the sink called them.
fn into_sink_error(err: StreamError) -> StreamError {
	match err {
		StreamError::Source(inner) => StreamError::Sink(inner),
		other => other,
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use async_trait::async_trait;
	use parking_lot::Mutex as SyncMutex;
	use tokio::sync::mpsc;

	use super::*;
	use crate::error::{NormalizedError, Result};
	use crate::source::{ChannelSink, Source};

	/// Sink whose writes wait for an external go signal.
	struct Held {
		log: Arc<SyncMutex<Vec<u32>>>,
		go: mpsc::Receiver<()>,
	}

	#[async_trait]
	impl Sink for Held {
		type Item = u32;

		async fn ready(&mut self) -> Result<()> {
			Ok(())
		}

		async fn write(&mut self, item: u32) -> Result<()> {
			let _ = self.go.recv().await;
			self.log.lock().push(item);
			Ok(())
		}

		async fn close(&mut self) -> Result<()> {
			Err(StreamError::Source(NormalizedError::new("io", "close failed")))
		}
	}

	fn held() -> (BackpressureGate<Held>, Arc<SyncMutex<Vec<u32>>>, mpsc::Sender<()>) {
		let log = Arc::new(SyncMutex::new(Vec::new()));
		let (go_tx, go) = mpsc::channel(8);
		let gate = BackpressureGate::new(Held {
			log: Arc::clone(&log),
			go,
		});
		(gate, log, go_tx)
	}

	#[tokio::test]
	async fn writes_reach_channel_in_order() {
		let (tx, mut rx) = mpsc::channel(1);
		let gate = BackpressureGate::new(ChannelSink::new(tx));
		gate.write(1).await.unwrap();
		let second = gate.write(2);
		assert_eq!(rx.pull().await, Ok(Some(1)));
		second.await.unwrap();
		assert_eq!(rx.pull().await, Ok(Some(2)));
		gate.close().await.unwrap();
		assert_eq!(rx.pull().await, Ok(None));
	}

	#[tokio::test]
	async fn overlapping_write_is_a_usage_violation() {
		let (gate, _log, go) = held();
		let first = gate.write(1);
		assert!(gate.is_busy());
		assert_eq!(gate.write(2).await, Err(StreamError::Usage(BUSY)));
		assert_eq!(gate.close().await, Err(StreamError::Usage(BUSY)));
		go.send(()).await.unwrap();
		first.await.unwrap();
	}

	#[tokio::test]
	async fn cancelled_write_still_completes() {
		let (gate, log, go) = held();
		gate.write(7).cancel();
		go.send(()).await.unwrap();
		tokio::time::timeout(Duration::from_millis(100), async {
			while gate.is_busy() {
				tokio::task::yield_now().await;
			}
		})
		.await
		.expect("detached write finishes");
		assert_eq!(*log.lock(), vec![7]);
	}

	#[tokio::test]
	async fn repeated_ready_calls_resolve_independently() {
		let (gate, _log, _go) = held();
		let a = gate.ready();
		let b = gate.ready();
		assert_eq!(b.await, Ok(()));
		assert_eq!(a.await, Ok(()));
	}

	#[tokio::test]
	async fn close_failure_is_a_sink_failure() {
		let (gate, _log, _go) = held();
		let err = gate.close().await.unwrap_err();
		assert!(matches!(err, StreamError::Sink(ref e) if e.message() == "close failed"));
	}

	#[tokio::test]
	async fn ready_waits_for_channel_capacity() {
		let (tx, mut rx) = mpsc::channel(1);
		let gate = BackpressureGate::new(ChannelSink::new(tx));
		gate.write(1).await.unwrap();

		let ready = gate.ready();
		let blocked = tokio::time::timeout(Duration::from_millis(10), ready).await;
		assert!(blocked.is_err(), "full channel is not ready");

		assert_eq!(rx.pull().await, Ok(Some(1)));
		tokio::time::timeout(Duration::from_millis(100), gate.ready())
			.await
			.expect("capacity freed")
			.unwrap();
	}

	#[tokio::test]
	async fn write_queues_behind_pending_ready() {
		let (tx, mut rx) = mpsc::channel(1);
		let gate = BackpressureGate::new(ChannelSink::new(tx));
		gate.write(1).await.unwrap();

		let ready = gate.ready();
		tokio::task::yield_now().await;
		let write = gate.write(2);
		assert!(gate.is_busy());
		assert_eq!(gate.write(3).await, Err(StreamError::Usage(BUSY)));

		assert_eq!(rx.pull().await, Ok(Some(1)));
		assert_eq!(write.await, Ok(()));
		assert!(!gate.is_busy());
		assert_eq!(rx.pull().await, Ok(Some(2)));
		assert_eq!(ready.await, Ok(()));
	}
}
