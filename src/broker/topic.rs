use crate::transport::ExchangeKind;

/// A (queue, routing key) pair attached to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
}

/// Represents an exchange in the in-memory broker
/// Holds the routing rule and the bindings that route into queues
#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub bindings: Vec<Binding>,
}

impl Exchange {
    /// Creates an exchange with no bindings
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            bindings: Vec::new(),
        }
    }

    /// Binds a queue under a routing key
    /// Binding the same pair twice has no effect
    pub fn bind(&mut self, queue: &str, routing_key: &str) {
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    /// Removes every binding that targets `queue`
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Returns the distinct queues a message with `routing_key` is routed to,
    /// in binding order
    pub fn route(&self, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matched = match self.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout => true,
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }
}

/// Matches a dotted routing key against a topic binding pattern.
///
/// `*` stands for exactly one word and `#` for zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &words)
}

fn matches_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| matches_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && matches_words(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first() == Some(literal) && matches_words(rest, &words[1..])
        }
    }
}
