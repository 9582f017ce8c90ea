use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::storage::{SledMode, expand_home_path, open_sled_db, parse_sled_mode};

use super::{
    ConversationHandle, QueueClient, QueueError, QueueMessage, ReceiveTransaction,
    qualified_queue_name,
};

const CONVERSATIONS_TREE: &str = "v1:conversations";
const QUEUE_TREE_PREFIX: &str = "v1:q:";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Open,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ConversationRecord {
    state: ConversationState,
    opened_at_ms: i64,
    closed_at_ms: Option<i64>,
    #[serde(default)]
    last_enqueued_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredMessage {
    conversation_handle: ConversationHandle,
    message_type_name: String,
    body: Vec<u8>,
    enqueued_at_ms: i64,
}

/// Queue facility on top of sled.
///
/// Messages live in one tree per qualified queue name, keyed by a
/// monotonically increasing id so iteration order is FIFO. Clones share the
/// in-flight registry, which locks a whole conversation while one of its
/// messages is held: consumers cloned from one handle never receive two
/// messages of the same conversation concurrently.
#[derive(Clone)]
pub struct SledQueue {
    db: sled::Db,
    queue_name: String,
    messages: sled::Tree,
    conversations: sled::Tree,
    in_flight: Arc<Mutex<HashMap<u64, ConversationHandle>>>,
}

impl SledQueue {
    pub fn from_app_config(app_config: &AppConfig, logger: &Logger) -> Result<Self, QueueError> {
        let data_path = expand_home_path(&app_config.broker.path).map_err(QueueError::Setup)?;
        let mode = parse_sled_mode(app_config.storage.sled.mode.as_deref())
            .map_err(QueueError::Setup)?;

        fs::create_dir_all(&data_path).map_err(|source| QueueError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let queue = Self::open(
            &data_path,
            app_config.storage.sled.cache_capacity,
            mode,
            &app_config.queue.schema,
            &app_config.queue.name,
        )?;

        logger.log(
            LogLevel::Info,
            Some("broker::init"),
            "Broker queue opened",
            Some(json!({
                "application_name": app_config.broker.application_name,
                "queue": queue.queue_name(),
                "resolved_path": data_path.display().to_string(),
                "pending_messages": queue.pending_messages(),
            })),
        );

        Ok(queue)
    }

    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
        schema: &str,
        name: &str,
    ) -> Result<Self, QueueError> {
        let db = open_sled_db(data_path, cache_capacity, mode).map_err(QueueError::Sled)?;
        Self::from_db(db, schema, name)
    }

    #[cfg(test)]
    pub fn temporary(schema: &str, name: &str) -> Result<Self, QueueError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(QueueError::Sled)?;
        Self::from_db(db, schema, name)
    }

    fn from_db(db: sled::Db, schema: &str, name: &str) -> Result<Self, QueueError> {
        let queue_name = qualified_queue_name(schema, name);
        let messages = db
            .open_tree(format!("{QUEUE_TREE_PREFIX}{queue_name}"))
            .map_err(QueueError::Sled)?;
        let conversations = db.open_tree(CONVERSATIONS_TREE).map_err(QueueError::Sled)?;

        Ok(Self {
            db,
            queue_name,
            messages,
            conversations,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn pending_messages(&self) -> usize {
        self.messages.len()
    }

    /// Opens a new conversation for producers.
    pub fn begin_dialog(&self) -> Result<ConversationHandle, QueueError> {
        let handle = ConversationHandle::new_random();
        let record = ConversationRecord {
            state: ConversationState::Open,
            opened_at_ms: Utc::now().timestamp_millis(),
            closed_at_ms: None,
            last_enqueued_at_ms: None,
        };
        self.conversations
            .insert(conversation_key(handle), encode(&record)?)
            .map_err(QueueError::Sled)?;
        Ok(handle)
    }

    /// Enqueues a message on an open conversation and returns its queue id.
    ///
    /// The open check and the insert share one sled transaction with the
    /// conversation record, so a send cannot interleave with a commit that
    /// closes the conversation.
    pub fn send(
        &self,
        handle: ConversationHandle,
        message_type_name: &str,
        body: &[u8],
    ) -> Result<u64, QueueError> {
        let id = self.db.generate_id().map_err(QueueError::Sled)?;
        let enqueued_at_ms = Utc::now().timestamp_millis();
        let stored = encode(&StoredMessage {
            conversation_handle: handle,
            message_type_name: message_type_name.to_owned(),
            body: body.to_vec(),
            enqueued_at_ms,
        })?;
        let message_key = id.to_be_bytes();
        let record_key = conversation_key(handle);

        let outcome: TransactionResult<(), QueueError> = (&self.messages, &self.conversations)
            .transaction(|(messages, conversations)| {
                let mut record = match conversations.get(record_key.as_slice())? {
                    None => return abort(QueueError::ConversationNotFound { handle }),
                    Some(raw) => decode_record(raw.as_ref()).or_else(abort)?,
                };
                if record.state == ConversationState::Closed {
                    return abort(QueueError::ConversationClosed { handle });
                }
                record.last_enqueued_at_ms = Some(enqueued_at_ms);
                let encoded = encode(&record).or_else(abort)?;

                conversations.insert(record_key.as_slice(), encoded)?;
                messages.insert(&message_key[..], stored.as_slice())?;
                Ok(())
            });
        outcome.map_err(transaction_error)?;
        Ok(id)
    }

    pub fn conversation_state(
        &self,
        handle: ConversationHandle,
    ) -> Result<Option<ConversationState>, QueueError> {
        Ok(self.load_conversation(handle)?.map(|record| record.state))
    }

    pub fn flush(&self) -> Result<(), QueueError> {
        self.db.flush().map(|_| ()).map_err(QueueError::Sled)
    }

    fn load_conversation(
        &self,
        handle: ConversationHandle,
    ) -> Result<Option<ConversationRecord>, QueueError> {
        self.conversations
            .get(conversation_key(handle))
            .map_err(QueueError::Sled)?
            .map(|raw| decode_record(raw.as_ref()))
            .transpose()
    }

    /// Marks the oldest message whose conversation nobody else holds as in
    /// flight and returns it.
    fn claim_next(&self) -> Result<Option<(u64, QueueMessage)>, QueueError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| QueueError::InFlightLockPoisoned)?;

        for entry in self.messages.iter() {
            let (key, value) = entry.map_err(QueueError::Sled)?;
            let id = decode_id(key.as_ref())?;
            if in_flight.contains_key(&id) {
                continue;
            }

            let stored: StoredMessage =
                serde_json::from_slice(value.as_ref()).map_err(QueueError::DeserializeRecord)?;
            if in_flight
                .values()
                .any(|held| *held == stored.conversation_handle)
            {
                continue;
            }
            in_flight.insert(id, stored.conversation_handle);
            return Ok(Some((
                id,
                QueueMessage {
                    conversation_handle: stored.conversation_handle,
                    message_type_name: stored.message_type_name,
                    body: stored.body,
                },
            )));
        }

        Ok(None)
    }

    /// Keys of queued messages on `handles` that no transaction currently holds.
    fn unclaimed_message_keys(
        &self,
        handles: &[ConversationHandle],
    ) -> Result<Vec<Vec<u8>>, QueueError> {
        if handles.is_empty() {
            return Ok(Vec::new());
        }
        let in_flight = self
            .in_flight
            .lock()
            .map_err(|_| QueueError::InFlightLockPoisoned)?;

        let mut keys = Vec::new();
        for entry in self.messages.iter() {
            let (key, value) = entry.map_err(QueueError::Sled)?;
            if in_flight.contains_key(&decode_id(key.as_ref())?) {
                continue;
            }
            let stored: StoredMessage =
                serde_json::from_slice(value.as_ref()).map_err(QueueError::DeserializeRecord)?;
            if handles.contains(&stored.conversation_handle) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    fn release(&self, id: u64) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&id);
        }
    }
}

impl QueueClient for SledQueue {
    type Transaction = SledReceiveTransaction;

    fn begin(&self) -> Result<Self::Transaction, QueueError> {
        Ok(SledReceiveTransaction {
            queue: self.clone(),
            receive_attempted: false,
            received: None,
            ended: Vec::new(),
        })
    }
}

/// Staged receive/end operations, applied atomically on commit.
pub struct SledReceiveTransaction {
    queue: SledQueue,
    receive_attempted: bool,
    received: Option<(u64, ConversationHandle)>,
    ended: Vec<ConversationHandle>,
}

impl SledReceiveTransaction {
    fn apply(&self) -> Result<(), QueueError> {
        if self.received.is_none() && self.ended.is_empty() {
            return Ok(());
        }

        let mut removals: Vec<Vec<u8>> = self
            .received
            .map(|(id, _)| id.to_be_bytes().to_vec())
            .into_iter()
            .collect();
        removals.extend(self.queue.unclaimed_message_keys(&self.ended)?);
        let closure_keys: Vec<(ConversationHandle, Vec<u8>)> = self
            .ended
            .iter()
            .map(|handle| (*handle, conversation_key(*handle)))
            .collect();
        let closed_at_ms = Utc::now().timestamp_millis();

        let outcome: TransactionResult<(), QueueError> = (
            &self.queue.messages,
            &self.queue.conversations,
        )
            .transaction(|(messages, conversations)| {
                for key in &removals {
                    messages.remove(key.as_slice())?;
                }
                for (handle, key) in &closure_keys {
                    let mut record = match conversations.get(key.as_slice())? {
                        None => return abort(QueueError::ConversationNotFound { handle: *handle }),
                        Some(raw) => decode_record(raw.as_ref()).or_else(abort)?,
                    };
                    // Already closed: this commit only discards a leftover message.
                    if record.state == ConversationState::Closed {
                        continue;
                    }
                    record.state = ConversationState::Closed;
                    record.closed_at_ms = Some(closed_at_ms);
                    conversations.insert(key.as_slice(), encode(&record).or_else(abort)?)?;
                }
                Ok(())
            });
        outcome.map_err(transaction_error)?;

        self.queue.flush()
    }
}

impl ReceiveTransaction for SledReceiveTransaction {
    fn receive(&mut self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        if self.receive_attempted {
            return Err(QueueError::ReceiveAlreadyAttempted);
        }
        self.receive_attempted = true;

        let deadline = Instant::now() + timeout;
        loop {
            // Subscribe before scanning so an insert between the two is not missed.
            let mut subscriber = self.queue.messages.watch_prefix(Vec::<u8>::new());
            if let Some((id, message)) = self.queue.claim_next()? {
                self.received = Some((id, message.conversation_handle));
                return Ok(Some(message));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match subscriber.next_timeout(remaining) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(QueueError::SubscriptionClosed),
            }
        }
    }

    /// Ending the conversation of the message this transaction received is
    /// always accepted, even if it was closed in the meantime, so a leftover
    /// message on a closed conversation can still be acknowledged.
    fn end_conversation(&mut self, handle: ConversationHandle) -> Result<(), QueueError> {
        if self.ended.contains(&handle) {
            return Err(QueueError::ConversationClosed { handle });
        }
        let holds_message = matches!(self.received, Some((_, held)) if held == handle);
        match self.queue.load_conversation(handle)? {
            None => return Err(QueueError::ConversationNotFound { handle }),
            Some(record) if record.state == ConversationState::Closed && !holds_message => {
                return Err(QueueError::ConversationClosed { handle });
            }
            Some(_) => {}
        }
        self.ended.push(handle);
        Ok(())
    }

    fn commit(self) -> Result<(), QueueError> {
        self.apply()
    }

    fn rollback(self) {}
}

impl Drop for SledReceiveTransaction {
    fn drop(&mut self) {
        if let Some((id, _)) = self.received.take() {
            self.queue.release(id);
        }
    }
}

fn conversation_key(handle: ConversationHandle) -> Vec<u8> {
    handle.as_uuid().as_bytes().to_vec()
}

fn decode_id(raw: &[u8]) -> Result<u64, QueueError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| QueueError::CorruptMessageKey { len: raw.len() })?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(record).map_err(QueueError::SerializeRecord)
}

fn decode_record(raw: &[u8]) -> Result<ConversationRecord, QueueError> {
    serde_json::from_slice(raw).map_err(QueueError::DeserializeRecord)
}

fn abort<T>(error: QueueError) -> Result<T, ConflictableTransactionError<QueueError>> {
    Err(ConflictableTransactionError::Abort(error))
}

fn transaction_error(error: TransactionError<QueueError>) -> QueueError {
    match error {
        TransactionError::Storage(source) => QueueError::Sled(source),
        TransactionError::Abort(source) => source,
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{ConversationState, SledQueue, StoredMessage, encode};
    use crate::broker::{QueueClient, QueueError, ReceiveTransaction};

    fn test_queue() -> SledQueue {
        SledQueue::temporary("dbo", "AuditQueue").expect("temporary queue should open")
    }

    #[test]
    fn empty_receive_times_out_and_commits_without_mutation() {
        let queue = test_queue();
        let mut tx = queue.begin().expect("begin should pass");

        let started = Instant::now();
        let received = tx
            .receive(Duration::from_millis(30))
            .expect("receive should pass");
        assert!(received.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
        tx.commit().expect("empty commit should pass");

        assert_eq!(queue.pending_messages(), 0);
    }

    #[test]
    fn receive_returns_messages_in_fifo_order() {
        let queue = test_queue();
        let first = queue.begin_dialog().expect("dialog should open");
        let second = queue.begin_dialog().expect("dialog should open");
        queue.send(first, "audit", b"one").expect("send should pass");
        queue.send(second, "audit", b"two").expect("send should pass");

        let mut tx = queue.begin().expect("begin should pass");
        let message = tx
            .receive(Duration::ZERO)
            .expect("receive should pass")
            .expect("a message should be available");
        assert_eq!(message.conversation_handle, first);
        assert_eq!(message.message_type_name, "audit");
        assert_eq!(message.body, b"one".to_vec());
    }

    #[test]
    fn commit_removes_message_and_closes_conversation() {
        let queue = test_queue();
        let handle = queue.begin_dialog().expect("dialog should open");
        queue.send(handle, "audit", b"<Root/>").expect("send should pass");

        let mut tx = queue.begin().expect("begin should pass");
        let message = tx
            .receive(Duration::from_millis(10))
            .expect("receive should pass")
            .expect("a message should be available");
        tx.end_conversation(message.conversation_handle)
            .expect("end should pass");
        tx.commit().expect("commit should pass");

        assert_eq!(queue.pending_messages(), 0);
        assert_eq!(
            queue.conversation_state(handle).expect("state lookup should pass"),
            Some(ConversationState::Closed)
        );
    }

    #[test]
    fn ending_conversation_discards_its_remaining_messages() {
        let queue = test_queue();
        let handle = queue.begin_dialog().expect("dialog should open");
        let other = queue.begin_dialog().expect("dialog should open");
        queue.send(handle, "audit", b"a").expect("send should pass");
        queue.send(handle, "audit", b"b").expect("send should pass");
        queue.send(other, "audit", b"c").expect("send should pass");

        let mut tx = queue.begin().expect("begin should pass");
        tx.receive(Duration::ZERO)
            .expect("receive should pass")
            .expect("a message should be available");
        tx.end_conversation(handle).expect("end should pass");
        tx.commit().expect("commit should pass");

        assert_eq!(queue.pending_messages(), 1);
        let mut next = queue.begin().expect("begin should pass");
        let remaining = next
            .receive(Duration::ZERO)
            .expect("receive should pass")
            .expect("message of the other conversation should remain");
        assert_eq!(remaining.conversation_handle, other);
    }

    #[test]
    fn rollback_redelivers_message() {
        let queue = test_queue();
        let handle = queue.begin_dialog().expect("dialog should open");
        queue.send(handle, "audit", b"payload").expect("send should pass");

        let mut tx = queue.begin().expect("begin should pass");
        tx.receive(Duration::ZERO)
            .expect("receive should pass")
            .expect("a message should be available");
        tx.end_conversation(handle).expect("end should pass");
        tx.rollback();

        assert_eq!(
            queue.conversation_state(handle).expect("state lookup should pass"),
            Some(ConversationState::Open)
        );
        let mut retry = queue.begin().expect("begin should pass");
        let redelivered = retry
            .receive(Duration::ZERO)
            .expect("receive should pass")
            .expect("message should be redelivered");
        assert_eq!(redelivered.body, b"payload".to_vec());
    }

    #[test]
    fn concurrent_transactions_do_not_share_a_message() {
        let queue = test_queue();
        let handle = queue.begin_dialog().expect("dialog should open");
        queue.send(handle, "audit", b"only").expect("send should pass");

        let mut holder = queue.begin().expect("begin should pass");
        assert!(holder
            .receive(Duration::ZERO)
            .expect("receive should pass")
            .is_some());

        let mut contender = queue.clone().begin().expect("begin should pass");
        assert!(contender
            .receive(Duration::from_millis(10))
            .expect("receive should pass")
            .is_none());
    }

    #[test]
    fn conversation_stays_locked_while_one_of_its_messages_is_in_flight() {
        let queue = test_queue();
        let locked = queue.begin_dialog().expect("dialog should open");
        let other = queue.begin_dialog().expect("dialog should open");
        queue.send(locked, "audit", b"first").expect("send should pass");
        queue.send(locked, "audit", b"second").expect("send should pass");
        queue.send(other, "audit", b"third").expect("send should pass");

        let mut holder = queue.begin().expect("begin should pass");
        let held = holder
            .receive(Duration::ZERO)
            .expect("receive should pass")
            .expect("a message should be available");
        assert_eq!(held.body, b"first".to_vec());

        let mut contender = queue.clone().begin().expect("begin should pass");
        let next = contender
            .receive(Duration::ZERO)
            .expect("receive should pass")
            .expect("the other conversation should be available");
        assert_eq!(next.conversation_handle, other);

        let mut starved = queue.clone().begin().expect("begin should pass");
        assert!(starved
            .receive(Duration::from_millis(10))
            .expect("receive should pass")
            .is_none());

        holder.end_conversation(locked).expect("end should pass");
        holder.commit().expect("commit should pass");

        assert_eq!(queue.pending_messages(), 1);
        assert_eq!(
            queue.conversation_state(locked).expect("state lookup should pass"),
            Some(ConversationState::Closed)
        );
    }

    #[test]
    fn leftover_message_on_closed_conversation_can_be_acknowledged() {
        let queue = test_queue();
        let handle = queue.begin_dialog().expect("dialog should open");
        let mut closer = queue.begin().expect("begin should pass");
        closer.end_conversation(handle).expect("end should pass");
        closer.commit().expect("commit should pass");

        // A message that slipped in around the close.
        let id = queue.db.generate_id().expect("id should be generated");
        let leftover = encode(&StoredMessage {
            conversation_handle: handle,
            message_type_name: "audit".to_owned(),
            body: b"late".to_vec(),
            enqueued_at_ms: 0,
        })
        .expect("message should encode");
        queue
            .messages
            .insert(id.to_be_bytes(), leftover)
            .expect("insert should pass");

        let mut tx = queue.begin().expect("begin should pass");
        let received = tx
            .receive(Duration::ZERO)
            .expect("receive should pass")
            .expect("leftover should be delivered");
        assert_eq!(received.conversation_handle, handle);
        tx.end_conversation(handle)
            .expect("ending the held conversation should pass");
        tx.commit().expect("commit should pass");

        assert_eq!(queue.pending_messages(), 0);
        assert_eq!(
            queue.conversation_state(handle).expect("state lookup should pass"),
            Some(ConversationState::Closed)
        );
    }

    #[test]
    fn receive_wakes_up_when_a_message_arrives() {
        let queue = test_queue();
        let producer = queue.clone();
        let handle = queue.begin_dialog().expect("dialog should open");

        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            producer.send(handle, "audit", b"late").expect("send should pass");
        });

        let mut tx = queue.begin().expect("begin should pass");
        let message = tx
            .receive(Duration::from_secs(5))
            .expect("receive should pass")
            .expect("late message should arrive before the timeout");
        assert_eq!(message.body, b"late".to_vec());
        worker.join().expect("producer thread should finish");
    }

    #[test]
    fn ended_conversation_cannot_be_reused() {
        let queue = test_queue();
        let handle = queue.begin_dialog().expect("dialog should open");

        let mut tx = queue.begin().expect("begin should pass");
        tx.end_conversation(handle).expect("end should pass");
        let twice = tx
            .end_conversation(handle)
            .expect_err("second end in one transaction should fail");
        assert!(matches!(twice, QueueError::ConversationClosed { .. }));
        tx.commit().expect("commit should pass");

        let send = queue
            .send(handle, "audit", b"late")
            .expect_err("send on ended conversation should fail");
        assert!(matches!(send, QueueError::ConversationClosed { .. }));

        let mut later = queue.begin().expect("begin should pass");
        let end_again = later
            .end_conversation(handle)
            .expect_err("ending a closed conversation should fail");
        assert!(matches!(end_again, QueueError::ConversationClosed { .. }));
    }

    #[test]
    fn unknown_conversation_and_second_receive_are_rejected() {
        let queue = test_queue();
        let mut tx = queue.begin().expect("begin should pass");

        let unknown = tx
            .end_conversation(crate::broker::ConversationHandle::new_random())
            .expect_err("unknown handle should fail");
        assert!(matches!(unknown, QueueError::ConversationNotFound { .. }));

        tx.receive(Duration::ZERO).expect("first receive should pass");
        let again = tx
            .receive(Duration::ZERO)
            .expect_err("second receive should fail");
        assert!(matches!(again, QueueError::ReceiveAlreadyAttempted));
    }
}
