use std::sync::{Arc, Mutex};
use crate::engine::channel::{Channel, ChannelListener, ListenerFactory};
use crate::ids::ConnectionId;
use crate::protocol::datapath_id::DatapathId;
use crate::protocol::header::MessageType;
use crate::protocol::message::Message;

/// What a [TrackingListener] observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Up {
        conn: ConnectionId,
        version: u8,
        datapath_id: DatapathId,
    },
    Down {
        conn: ConnectionId,
    },
    Message {
        conn: ConnectionId,
        message_type: MessageType,
        xid: u32,
    },
    Tickle {
        conn: ConnectionId,
    },
}

/// The events of all listeners created by a [tracking_factory], in the order they happened
#[derive(Clone, Default)]
pub struct ListenerTracker {
    events: Arc<Mutex<Vec<ListenerEvent>>>,
    messages: Arc<Mutex<Vec<Message>>>,
}

impl ListenerTracker {
    fn push(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Removes and returns all events recorded so far
    pub fn take(&self) -> Vec<ListenerEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// The messages received so far, including their data
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn assert_no_events(&self) {
        let events = self.events();
        if !events.is_empty() {
            panic!("unexpected listener events: {:?}", events);
        }
    }

    /// Asserts that the oldest recorded event is `expected`, removing it
    pub fn assert_event(&self, expected: ListenerEvent) {
        let mut events = self.events.lock().unwrap();
        if events.is_empty() {
            panic!("no listener event, expected {:?}", expected);
        }
        let actual = events.remove(0);
        assert_eq!(actual, expected);
    }
}

/// A listener recording everything it sees. It answers a [MessageType::BarrierRequest] with a
///  barrier reply, and shuts down its channel when receiving an [MessageType::Experimenter]
///  message.
pub struct TrackingListener {
    tracker: ListenerTracker,
}

impl ChannelListener for TrackingListener {
    fn on_channel_up(&mut self, channel: &mut Channel<'_>) {
        self.tracker.push(ListenerEvent::Up {
            conn: channel.connection_id(),
            version: channel.version(),
            datapath_id: channel.datapath_id(),
        });
    }

    fn on_channel_down(&mut self, channel: &mut Channel<'_>) {
        self.tracker.push(ListenerEvent::Down { conn: channel.connection_id() });
    }

    fn on_message(&mut self, channel: &mut Channel<'_>, message: &Message) {
        self.tracker.push(ListenerEvent::Message {
            conn: channel.connection_id(),
            message_type: message.message_type(),
            xid: message.xid(),
        });
        self.tracker.messages.lock().unwrap().push(message.clone());

        match message.message_type() {
            MessageType::BarrierRequest => {
                let reply = Message::build(message.version(), MessageType::BarrierReply, message.xid(), &[]);
                channel.send(&reply);
            }
            MessageType::Experimenter => channel.shutdown(),
            _ => {}
        }
    }

    fn on_tickle(&mut self, channel: &mut Channel<'_>) {
        self.tracker.push(ListenerEvent::Tickle { conn: channel.connection_id() });
    }
}

pub fn tracking_factory() -> (ListenerFactory, ListenerTracker) {
    let tracker = ListenerTracker::default();
    let for_factory = tracker.clone();
    let factory: ListenerFactory = Arc::new(move || Box::new(TrackingListener { tracker: for_factory.clone() }));
    (factory, tracker)
}
