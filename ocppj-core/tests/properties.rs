//! Property tests for the correlation queue and the envelope codec
//!
//! - Single flight: never more than one call outstanding
//! - FIFO: outcomes arrive in submission order, each exactly once
//! - Codec: decode(encode(x)) == x for every envelope kind

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Map, Value};

use ocppj_core::queue::{Callback, SendFn};
use ocppj_core::{
    Call, CallError, CallResult, CorrelationQueue, ErrorCode, IdStrategy, ManualTimer,
    MessageIdGenerator, OcppError, OcppMessage,
};

const TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Enqueue,
    Reply,
    StrayReply,
    Expire,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Enqueue),
        3 => Just(Op::Reply),
        1 => Just(Op::StrayReply),
        1 => Just(Op::Expire),
    ]
}

fn id_strategy() -> impl Strategy<Value = IdStrategy> {
    prop_oneof![Just(IdStrategy::Sequential), Just(IdStrategy::Random)]
}

fn message_id() -> impl Strategy<Value = String> {
    "[A-Za-z0-9-]{1,36}"
}

fn action() -> impl Strategy<Value = String> {
    "[A-Z][A-Za-z]{0,30}"
}

fn payload() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[ -~]{0,16}".prop_map(Value::String),
    ];
    prop::collection::btree_map("[a-zA-Z]{1,12}", leaf, 0..6)
        .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
}

fn error_code() -> impl Strategy<Value = ErrorCode> {
    prop::sample::select(vec![
        ErrorCode::NotImplemented,
        ErrorCode::NotSupported,
        ErrorCode::InternalError,
        ErrorCode::ProtocolError,
        ErrorCode::SecurityError,
        ErrorCode::FormationViolation,
        ErrorCode::PropertyConstraintViolation,
        ErrorCode::OccurrenceConstraintViolation,
        ErrorCode::TypeConstraintViolation,
        ErrorCode::GenericError,
    ])
}

fn message() -> impl Strategy<Value = OcppMessage> {
    prop_oneof![
        (message_id(), action(), payload())
            .prop_map(|(id, action, payload)| OcppMessage::Call(Call::new(id, action, payload))),
        (message_id(), payload()).prop_map(|(message_id, payload)| {
            OcppMessage::CallResult(CallResult { message_id, payload })
        }),
        (message_id(), error_code(), "[ -~]{0,40}", payload()).prop_map(
            |(id, code, description, details)| {
                OcppMessage::CallError(CallError::new(id, code, description).with_details(details))
            }
        ),
    ]
}

// ============================================================================
// Queue harness
// ============================================================================

struct Harness {
    queue: CorrelationQueue,
    timer: ManualTimer,
    ids: Arc<MessageIdGenerator>,
    sent: Arc<Mutex<Vec<String>>>,
    settled: Arc<Mutex<Vec<(usize, bool)>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_ids(IdStrategy::Sequential)
    }

    fn with_ids(strategy: IdStrategy) -> Self {
        let timer = ManualTimer::new();
        Self {
            queue: CorrelationQueue::new(Arc::new(timer.clone()), TIMEOUT),
            timer,
            ids: Arc::new(MessageIdGenerator::new(strategy)),
            sent: Arc::new(Mutex::new(Vec::new())),
            settled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn enqueue(&self, tag: usize) {
        let ids = self.ids.clone();
        let sent = self.sent.clone();
        let send: SendFn = Box::new(move || {
            let (id, text) = ids.encode_call("Heartbeat", json!({}), |_| false)?;
            // The id on the wire is the one the queue correlates on.
            match OcppMessage::parse(text.as_bytes())? {
                OcppMessage::Call(call) if call.message_id == id => {}
                other => panic!("Encoded frame does not carry {}: {:?}", id, other),
            }
            sent.lock().push(id.clone());
            Ok(id)
        });

        let settled = self.settled.clone();
        let callback: Callback = Box::new(move |outcome| {
            settled.lock().push((tag, matches!(outcome, Err(OcppError::Cancelled))));
        });

        self.queue.enqueue(send, callback).unwrap();
    }

    fn outstanding(&self) -> usize {
        self.sent.lock().len() - self.settled.lock().len()
    }
}

// ============================================================================
// Queue properties
// ============================================================================

proptest! {
    /// CORE INVARIANT: at most one call awaits a reply, outcomes follow
    /// submission order, and shutdown settles everything left exactly once
    #[test]
    fn single_flight_fifo_exactly_once(ops in prop::collection::vec(op(), 1..60)) {
        let h = Harness::new();
        let mut enqueued = 0usize;

        for op in ops {
            match op {
                Op::Enqueue => {
                    h.enqueue(enqueued);
                    enqueued += 1;
                }
                Op::Reply => {
                    if let Some(id) = h.queue.in_flight() {
                        let resolved = h.queue.resolve(&id, Ok(json!({})));
                        prop_assert!(resolved.is_ok());
                    }
                }
                Op::StrayReply => {
                    let before = h.queue.in_flight();
                    let resolved = h.queue.resolve("stray", Ok(json!({})));
                    prop_assert!(resolved.is_err());
                    prop_assert_eq!(h.queue.in_flight(), before);
                }
                Op::Expire => h.timer.advance(TIMEOUT),
            }

            let outstanding = h.outstanding();
            prop_assert!(outstanding <= 1);
            prop_assert_eq!(outstanding == 1, h.queue.in_flight().is_some());
            prop_assert_eq!(h.queue.buffered(), enqueued - h.sent.lock().len());
        }

        h.queue.shutdown();

        let settled = h.settled.lock();
        let tags: Vec<usize> = settled.iter().map(|(tag, _)| *tag).collect();
        prop_assert_eq!(tags, (0..enqueued).collect::<Vec<_>>());
        prop_assert_eq!(h.timer.armed(), 0);
    }

    /// Ids minted for the wire are fresh: never reused while the connection lives
    #[test]
    fn sent_ids_are_unique(
        strategy in id_strategy(),
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let h = Harness::with_ids(strategy);
        for (tag, op) in ops.into_iter().enumerate() {
            match op {
                Op::Enqueue => h.enqueue(tag),
                Op::Reply => {
                    if let Some(id) = h.queue.in_flight() {
                        let _ = h.queue.resolve(&id, Ok(Value::Null));
                    }
                }
                Op::StrayReply => {}
                Op::Expire => h.timer.advance(TIMEOUT),
            }
        }

        let sent = h.sent.lock().clone();
        if strategy == IdStrategy::Sequential {
            let expected: Vec<String> = (1..=sent.len()).map(|n| n.to_string()).collect();
            prop_assert_eq!(&sent, &expected);
        }

        let mut unique = sent.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), sent.len());
    }
}

// ============================================================================
// Codec properties
// ============================================================================

proptest! {
    /// decode(encode(x)) == x
    #[test]
    fn envelope_round_trip(msg in message()) {
        let text = msg.to_text().unwrap();
        let decoded = OcppMessage::parse(text.as_bytes()).unwrap();
        prop_assert_eq!(decoded, msg);
    }
}
