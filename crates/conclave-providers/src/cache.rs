use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::json;

use conclave_types::{CompletionRequest, CompletionResponse};

/// Deterministic cache key. Deliberately covers only
/// `{messages, model, temperature, max_tokens}` so hit rates match the
/// established behavior; tools and cost constraints do not participate.
pub fn cache_key(request: &CompletionRequest) -> String {
    json!({
        "messages": request.messages,
        "model": request.model,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
    })
    .to_string()
}

struct Node {
    key: String,
    value: CompletionResponse,
    inserted_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU map over a hash index and an intrusive doubly-linked recency list.
/// Entries expire on lookup once older than the TTL; inserts at capacity
/// evict the least recently used entry.
pub struct CompletionCache {
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    max_size: usize,
    ttl: Duration,
}

impl CompletionCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, key: &str) -> Option<CompletionResponse> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&mut self, key: &str, now: Instant) -> Option<CompletionResponse> {
        let index = *self.map.get(key)?;
        let inserted_at = self.nodes[index].as_ref().expect("linked node").inserted_at;
        if now.duration_since(inserted_at) > self.ttl {
            self.remove_index(index);
            return None;
        }
        self.unlink(index);
        self.push_front(index);
        Some(self.nodes[index].as_ref().expect("linked node").value.clone())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: CompletionResponse) {
        let key = key.into();
        if let Some(&existing) = self.map.get(&key) {
            self.remove_index(existing);
        }
        if self.map.len() >= self.max_size {
            if let Some(tail) = self.tail {
                self.remove_index(tail);
            }
        }
        let node = Node {
            key: key.clone(),
            value,
            inserted_at: Instant::now(),
            prev: None,
            next: None,
        };
        let index = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, index);
        self.push_front(index);
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    fn push_front(&mut self, index: usize) {
        {
            let node = self.nodes[index].as_mut().expect("linked node");
            node.prev = None;
            node.next = self.head;
        }
        if let Some(head) = self.head {
            self.nodes[head].as_mut().expect("linked node").prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.nodes[index].as_ref().expect("linked node");
            (node.prev, node.next)
        };
        match prev {
            Some(prev_index) => {
                self.nodes[prev_index].as_mut().expect("linked node").next = next
            }
            None => self.head = next,
        }
        match next {
            Some(next_index) => {
                self.nodes[next_index].as_mut().expect("linked node").prev = prev
            }
            None => self.tail = prev,
        }
        let node = self.nodes[index].as_mut().expect("linked node");
        node.prev = None;
        node.next = None;
    }

    fn remove_index(&mut self, index: usize) {
        self.unlink(index);
        let node = self.nodes[index].take().expect("linked node");
        self.map.remove(&node.key);
        self.free.push(index);
    }
}
