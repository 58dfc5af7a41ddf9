//! # Question Service
//!
//! Correlates questions sent to a client with the answers that come back.
//! Each question gets a fresh random `RequestId`; the answer is delivered to
//! the callback registered under it, once. Answered and discarded entries
//! are removed, so a repeated or unknown answer is a silent no-op.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relayrpc::RequestId;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Receives the answer to one question.
pub type ResultCallback = Box<dyn FnOnce(Value) + Send + Sync + 'static>;

#[derive(Default)]
pub struct QuestionService {
    waiting: DashMap<RequestId, ResultCallback>,
}

impl QuestionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `callback` under a fresh request id.
    pub fn register(&self, callback: ResultCallback) -> RequestId {
        let mut callback = Some(callback);
        loop {
            if let Entry::Vacant(slot) = self.waiting.entry(RequestId::random()) {
                let id = *slot.key();
                if let Some(callback) = callback.take() {
                    slot.insert(callback);
                }
                return id;
            }
        }
    }

    /// Registers a question whose answer arrives on the returned receiver.
    pub fn ask(&self) -> (RequestId, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let id = self.register(Box::new(move |answer: Value| {
            let _ = tx.send(answer);
        }));
        (id, rx)
    }

    /// Delivers `answer` to the question registered under `id`. Returns
    /// false when nothing was waiting.
    pub fn set_result(&self, id: RequestId, answer: Value) -> bool {
        match self.waiting.remove(&id) {
            Some((_, callback)) => {
                callback(answer);
                true
            }
            None => {
                debug!(request = %id, "answer for no pending question");
                false
            }
        }
    }

    /// Forgets a question without answering it.
    pub fn discard(&self, id: RequestId) -> bool {
        self.waiting.remove(&id).is_some()
    }

    /// Number of unanswered questions.
    pub fn pending(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_register_yields_unique_ids() {
        let service = QuestionService::new();
        let ids: HashSet<RequestId> = (0..20_000)
            .map(|_| service.register(Box::new(|_: Value| {})))
            .collect();
        assert_eq!(ids.len(), 20_000);
        assert_eq!(service.pending(), 20_000);
    }

    #[test]
    fn test_answer_delivered_once() {
        let service = QuestionService::new();
        let answers = Arc::new(Mutex::new(Vec::new()));
        let sink = answers.clone();
        let id = service.register(Box::new(move |answer: Value| sink.lock().unwrap().push(answer)));

        assert!(service.set_result(id, json!("yes")));
        assert!(!service.set_result(id, json!("again")));
        assert_eq!(*answers.lock().unwrap(), vec![json!("yes")]);
        assert_eq!(service.pending(), 0);
    }

    #[test]
    fn test_unknown_answer_is_ignored() {
        let service = QuestionService::new();
        assert!(!service.set_result(RequestId::random(), json!(1)));
    }

    #[tokio::test]
    async fn test_ask_resolves_and_discard_closes() {
        let service = QuestionService::new();

        let (id, answer) = service.ask();
        service.set_result(id, json!({"choice": 2}));
        assert_eq!(answer.await.unwrap(), json!({"choice": 2}));

        let (id, dropped) = service.ask();
        assert!(service.discard(id));
        assert!(dropped.await.is_err());
        assert!(!service.set_result(id, json!(null)));
    }
}
