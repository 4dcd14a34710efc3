//! Pull-based sources and readiness-gated sinks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{NormalizedError, Result, StreamError};

/// Pull-based asynchronous item producer.
///
/// Pulls are strictly sequential: `&mut self` makes a second pull impossible while one is in
/// flight. Implementations should be cancel-safe, since a pull future may be dropped by a
/// cancelled reader.
#[async_trait]
pub trait Source: Send {
	/// Item type produced by this source.
	type Item: Send;

	/// Pulls the next item. `Ok(None)` signals end-of-stream.
	async fn pull(&mut self) -> Result<Option<Self::Item>>;

	/// Stops the source. No further items are produced afterwards. Idempotent.
	async fn cancel(&mut self) -> Result<()>;
}

/// Push-based asynchronous item consumer with readiness-gated backpressure.
#[async_trait]
pub trait Sink: Send {
	/// Item type accepted by this sink.
	type Item: Send;

	/// Resolves once the sink has capacity for another write.
	async fn ready(&mut self) -> Result<()>;

	/// Writes one item.
	async fn write(&mut self, item: Self::Item) -> Result<()>;

	/// Finalizes the stream.
	async fn close(&mut self) -> Result<()>;
}

/// Source over an in-memory iterator.
#[derive(Debug)]
pub struct IterSource<I> {
	iter: Option<I>,
}

impl<I: Iterator> IterSource<I> {
	/// Creates a source yielding the iterator's items, then end-of-stream.
	pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
		Self {
			iter: Some(iter.into_iter()),
		}
	}
}

#[async_trait]
impl<I> Source for IterSource<I>
where
	I: Iterator + Send,
	I::Item: Send,
{
	type Item = I::Item;

	async fn pull(&mut self) -> Result<Option<I::Item>> {
		Ok(self.iter.as_mut().and_then(Iterator::next))
	}

	async fn cancel(&mut self) -> Result<()> {
		self.iter = None;
		Ok(())
	}
}

#[async_trait]
impl<T: Send> Source for mpsc::Receiver<T> {
	type Item = T;

	async fn pull(&mut self) -> Result<Option<T>> {
		Ok(self.recv().await)
	}

	async fn cancel(&mut self) -> Result<()> {
		self.close();
		while self.try_recv().is_ok() {}
		Ok(())
	}
}

/// Sink over a bounded tokio channel. Closing drops the sender.
#[derive(Debug)]
pub struct ChannelSink<T> {
	tx: Option<mpsc::Sender<T>>,
}

impl<T> ChannelSink<T> {
	/// Wraps a sender.
	pub fn new(tx: mpsc::Sender<T>) -> Self {
		Self { tx: Some(tx) }
	}

	fn sender(&self) -> Result<&mpsc::Sender<T>> {
		self.tx.as_ref().ok_or(StreamError::Closed)
	}
}

fn receiver_gone() -> StreamError {
	StreamError::Sink(NormalizedError::new("closed", "channel receiver dropped"))
}

#[async_trait]
impl<T: Send> Sink for ChannelSink<T> {
	type Item = T;

	async fn ready(&mut self) -> Result<()> {
		// A reserved permit is released on drop, so this only observes capacity.
		self.sender()?.reserve().await.map(drop).map_err(|_| receiver_gone())
	}

	async fn write(&mut self, item: T) -> Result<()> {
		self.sender()?.send(item).await.map_err(|_| receiver_gone())
	}

	async fn close(&mut self) -> Result<()> {
		self.tx.take().map(drop).ok_or(StreamError::Closed)
	}
}
