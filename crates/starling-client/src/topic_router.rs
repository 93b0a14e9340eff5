//! Topic-pattern subscription matching for pub/sub notifications.
//!
//! Patterns are dot-separated segments. `*` matches exactly one segment,
//! `**` matches one or more trailing segments. `orders.*.created` matches
//! `orders.123.created` but not `orders.123.456.created`; `orders.**`
//! matches both, but not a bare `orders`.

use std::cmp::Reverse;
use std::sync::Arc;

use serde_json::Value;

use crate::error::TopicError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Single,
    Multi,
}

fn compile(pattern: &str) -> Result<Vec<Token>, TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::InvalidPattern(pattern.to_string()));
    }
    let tokens: Vec<Token> = pattern
        .split('.')
        .map(|seg| match seg {
            "*" => Token::Single,
            "**" => Token::Multi,
            "" => Token::Literal(String::new()),
            other => Token::Literal(other.to_string()),
        })
        .collect();
    Ok(tokens)
}

fn token_match(tokens: &[Token], segments: &[&str]) -> bool {
    match tokens.first() {
        None => segments.is_empty(),
        Some(Token::Literal(lit)) => match segments.first() {
            Some(seg) if seg == lit => token_match(&tokens[1..], &segments[1..]),
            _ => false,
        },
        Some(Token::Single) => {
            !segments.is_empty() && token_match(&tokens[1..], &segments[1..])
        }
        Some(Token::Multi) => {
            if segments.is_empty() {
                return false;
            }
            if tokens.len() == 1 {
                return true;
            }
            for split in 1..=segments.len() {
                if token_match(&tokens[1..], &segments[split..]) {
                    return true;
                }
            }
            false
        }
    }
}

pub type TopicHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;
pub type TopicFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Per-subscription options, mirroring the wire `options: {persistent,
/// priority, filter}` object.
#[derive(Clone)]
pub struct TopicOptions {
    /// Higher values dispatch first; ties broken by subscription order.
    pub priority: i32,
    /// If `false`, the subscription is removed after its first matching
    /// (and filter-accepted) dispatch. Defaults to `true`.
    pub persistent: bool,
    /// If present, `dispatch` skips this subscription whenever the filter
    /// returns `false` for the notification payload.
    pub filter: Option<TopicFilter>,
}

impl TopicOptions {
    pub fn new() -> Self {
        Self {
            priority: 0,
            persistent: true,
            filter: None,
        }
    }
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscription {
    id: u64,
    pattern: String,
    tokens: Vec<Token>,
    priority: i32,
    persistent: bool,
    filter: Option<TopicFilter>,
    handler: TopicHandler,
}

/// Routes inbound topic notifications to subscribed handlers.
///
/// Owned exclusively by `ConnectionCore`'s reactor task.
#[derive(Default)]
pub struct TopicRouter {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a pattern. Higher `priority` values are dispatched
    /// first; subscriptions with equal priority run in subscription order.
    pub fn subscribe(
        &mut self,
        pattern: &str,
        options: TopicOptions,
        handler: TopicHandler,
    ) -> Result<u64, TopicError> {
        let tokens = compile(pattern)?;
        let id = self.next_id;
        self.next_id += 1;
        self.subscriptions.push(Subscription {
            id,
            pattern: pattern.to_string(),
            tokens,
            priority: options.priority,
            persistent: options.persistent,
            filter: options.filter,
            handler,
        });
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.subscriptions.retain(|s| s.id != id);
    }

    pub fn is_subscribed(&self, pattern: &str) -> bool {
        self.subscriptions.iter().any(|s| s.pattern == pattern)
    }

    /// Dispatch a topic notification to every matching handler, in
    /// priority order (ties broken by subscription order). A subscription
    /// whose `filter` rejects the payload is skipped without consuming its
    /// one-shot lifetime; a non-persistent subscription is removed right
    /// after the handler it was actually delivered to runs.
    pub fn dispatch(&mut self, topic: &str, data: &Value) {
        let segments: Vec<&str> = topic.split('.').collect();
        let mut matched: Vec<u64> = self
            .subscriptions
            .iter()
            .filter(|s| token_match(&s.tokens, &segments))
            .filter(|s| s.filter.as_ref().map(|f| f(data)).unwrap_or(true))
            .map(|s| s.id)
            .collect();
        matched.sort_by_key(|id| {
            let sub = self.subscriptions.iter().find(|s| s.id == *id).expect("matched id exists");
            (Reverse(sub.priority), sub.id)
        });

        let mut to_remove = Vec::new();
        for id in matched {
            let Some(sub) = self.subscriptions.iter().find(|s| s.id == id) else {
                continue;
            };
            (sub.handler)(topic, data);
            if !sub.persistent {
                to_remove.push(id);
            }
        }
        if !to_remove.is_empty() {
            self.subscriptions.retain(|s| !to_remove.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn priority(p: i32) -> TopicOptions {
        TopicOptions {
            priority: p,
            ..TopicOptions::new()
        }
    }

    #[test]
    fn single_wildcard_matches_one_segment() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&hits);
        router
            .subscribe(
                "orders.*.created",
                TopicOptions::new(),
                Arc::new(move |topic, _| h.lock().unwrap().push(topic.to_string())),
            )
            .unwrap();

        router.dispatch("orders.123.created", &Value::Null);
        router.dispatch("orders.123.456.created", &Value::Null);

        assert_eq!(*hits.lock().unwrap(), vec!["orders.123.created"]);
    }

    #[test]
    fn double_wildcard_matches_any_depth() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(Mutex::new(0usize));
        let h = Arc::clone(&hits);
        router
            .subscribe(
                "orders.**",
                TopicOptions::new(),
                Arc::new(move |_, _| {
                    *h.lock().unwrap() += 1;
                }),
            )
            .unwrap();

        router.dispatch("orders.123.created", &Value::Null);
        router.dispatch("orders.123.456.shipped", &Value::Null);
        router.dispatch("users.123", &Value::Null);

        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[test]
    fn higher_priority_dispatches_first() {
        let mut router = TopicRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        router
            .subscribe(
                "a.b",
                priority(0),
                Arc::new(move |_, _| o1.lock().unwrap().push("low")),
            )
            .unwrap();
        let o2 = Arc::clone(&order);
        router
            .subscribe(
                "a.b",
                priority(10),
                Arc::new(move |_, _| o2.lock().unwrap().push("high")),
            )
            .unwrap();

        router.dispatch("a.b", &Value::Null);
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn double_wildcard_requires_at_least_one_tail_segment() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(Mutex::new(0usize));
        let h = Arc::clone(&hits);
        router
            .subscribe(
                "orders.**",
                TopicOptions::new(),
                Arc::new(move |_, _| {
                    *h.lock().unwrap() += 1;
                }),
            )
            .unwrap();

        // No trailing segment at all: "**" must match one or more tokens,
        // so a bare "orders" does not count.
        router.dispatch("orders", &Value::Null);
        assert_eq!(*hits.lock().unwrap(), 0);

        router.dispatch("orders.created", &Value::Null);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_stops_dispatch() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(Mutex::new(0usize));
        let h = Arc::clone(&hits);
        let id = router
            .subscribe(
                "a.b",
                TopicOptions::new(),
                Arc::new(move |_, _| {
                    *h.lock().unwrap() += 1;
                }),
            )
            .unwrap();
        router.unsubscribe(id);
        router.dispatch("a.b", &Value::Null);
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn filter_skips_non_matching_payloads() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&hits);
        let options = TopicOptions {
            filter: Some(Arc::new(|data: &Value| data["urgent"] == Value::Bool(true))),
            ..TopicOptions::new()
        };
        router
            .subscribe(
                "alerts",
                options,
                Arc::new(move |_, data| h.lock().unwrap().push(data.clone())),
            )
            .unwrap();

        router.dispatch("alerts", &serde_json::json!({"urgent": false}));
        router.dispatch("alerts", &serde_json::json!({"urgent": true}));

        assert_eq!(*hits.lock().unwrap(), vec![serde_json::json!({"urgent": true})]);
    }

    #[test]
    fn non_persistent_subscription_fires_once() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(Mutex::new(0usize));
        let h = Arc::clone(&hits);
        let options = TopicOptions {
            persistent: false,
            ..TopicOptions::new()
        };
        router
            .subscribe(
                "a.b",
                options,
                Arc::new(move |_, _| {
                    *h.lock().unwrap() += 1;
                }),
            )
            .unwrap();

        router.dispatch("a.b", &Value::Null);
        router.dispatch("a.b", &Value::Null);

        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
