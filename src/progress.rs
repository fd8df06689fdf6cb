//! In-process topic-indexed pub/sub.
//!
//! One logical topic per study. Publishing never blocks; each subscriber
//! reads from its own broadcast receiver. Receivers that fall behind lose
//! intermediate snapshots only: the broadcast ring always retains the
//! newest messages, so the terminal snapshot of a topic is delivered to
//! every live subscriber.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

const TOPIC_CAPACITY: usize = 256;

/// Topic-keyed broadcast bus. Topics are created lazily on first use and
/// removed by [`TopicBus::close`]; closed topics let subscribers drain
/// buffered messages before observing the end of the stream.
pub struct TopicBus<T> {
	topics: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone> Default for TopicBus<T> {
	fn default() -> Self {
		Self {
			topics: Mutex::new(HashMap::new()),
		}
	}
}

impl<T: Clone> TopicBus<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Subscribes to a topic, creating it if necessary. Only messages
	/// published after this call are observed.
	pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<T> {
		let mut topics = self.topics.lock().unwrap();
		topics
			.entry(topic.to_string())
			.or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
			.subscribe()
	}

	/// Publishes to a topic without blocking. Returns the number of
	/// subscribers that will observe the message.
	pub fn publish(&self, topic: &str, message: T) -> usize {
		let topics = self.topics.lock().unwrap();
		topics
			.get(topic)
			.map_or(0, |sender| sender.send(message).unwrap_or(0))
	}

	/// Drops the topic. Subscribers drain what is already buffered and
	/// then observe a closed channel.
	pub fn close(&self, topic: &str) {
		let mut topics = self.topics.lock().unwrap();
		if topics.remove(topic).is_some() {
			trace!(topic, "Closed topic");
		}
	}

	pub fn has_subscribers(&self, topic: &str) -> bool {
		let topics = self.topics.lock().unwrap();
		topics
			.get(topic)
			.is_some_and(|sender| sender.receiver_count() > 0)
	}
}

/// Published by the Storage-SCP for every instance it persisted,
/// keyed by study instance UID. The retrieve orchestrator subscribes to
/// follow C-MOVE sub-operations that arrive out-of-band.
#[derive(Debug, Clone)]
pub struct IngestEvent {
	pub study_instance_uid: String,
	pub series_instance_uid: String,
	pub sop_instance_uid: String,
	pub calling_aet: String,
}

pub type IngestBus = TopicBus<IngestEvent>;

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn messages_arrive_in_publish_order() {
		let bus: TopicBus<u32> = TopicBus::new();
		let mut rx = bus.subscribe("1.2.3");
		for i in 0..10 {
			bus.publish("1.2.3", i);
		}
		for i in 0..10 {
			assert_eq!(rx.recv().await.unwrap(), i);
		}
	}

	#[tokio::test]
	async fn publish_without_subscribers_is_a_no_op() {
		let bus: TopicBus<u32> = TopicBus::new();
		assert_eq!(bus.publish("1.2.3", 42), 0);
	}

	#[tokio::test]
	async fn subscribers_observe_the_terminal_message_then_close() {
		let bus: TopicBus<&'static str> = TopicBus::new();
		let mut rx = bus.subscribe("study");
		bus.publish("study", "pending");
		bus.publish("study", "terminal");
		bus.close("study");

		assert_eq!(rx.recv().await.unwrap(), "pending");
		assert_eq!(rx.recv().await.unwrap(), "terminal");
		assert!(matches!(
			rx.recv().await,
			Err(broadcast::error::RecvError::Closed)
		));
	}

	#[tokio::test]
	async fn topics_are_independent() {
		let bus: TopicBus<u32> = TopicBus::new();
		let mut a = bus.subscribe("a");
		let _b = bus.subscribe("b");
		bus.publish("a", 1);
		assert_eq!(a.recv().await.unwrap(), 1);
		assert!(bus.has_subscribers("b"));
		bus.close("b");
		assert!(!bus.has_subscribers("b"));
	}
}
