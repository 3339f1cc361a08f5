use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::runtime::net::ConditionId;

pub type TokenId = Uuid;

/// Condition -> resident tokens, oldest first.
///
/// A token id lives in at most one condition at a time; the owning runner
/// is the only writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Marking {
    places: BTreeMap<ConditionId, Vec<TokenId>>,
}

impl Marking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, condition: &str) -> usize {
        self.places.get(condition).map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_marked(&self, condition: &str) -> bool {
        self.count(condition) > 0
    }

    pub fn is_empty(&self) -> bool {
        self.places.values().all(|t| t.is_empty())
    }

    pub fn tokens_at(&self, condition: &str) -> &[TokenId] {
        self.places.get(condition).map(|t| t.as_slice()).unwrap_or(&[])
    }

    /// Marked conditions with their token counts.
    pub fn marked(&self) -> impl Iterator<Item = (&ConditionId, usize)> {
        self.places
            .iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(c, t)| (c, t.len()))
    }

    pub fn total_tokens(&self) -> usize {
        self.places.values().map(|t| t.len()).sum()
    }

    pub fn locate(&self, token: &TokenId) -> Option<&ConditionId> {
        self.places
            .iter()
            .find(|(_, tokens)| tokens.contains(token))
            .map(|(c, _)| c)
    }

    /// Places a token; a token already resident elsewhere is moved, never duplicated.
    pub fn put(&mut self, condition: &str, token: TokenId) {
        for tokens in self.places.values_mut() {
            tokens.retain(|t| *t != token);
        }
        self.places.entry(condition.to_string()).or_default().push(token);
    }

    /// Removes the oldest token at `condition`.
    pub fn take(&mut self, condition: &str) -> Option<TokenId> {
        let tokens = self.places.get_mut(condition)?;
        if tokens.is_empty() {
            return None;
        }
        let token = tokens.remove(0);
        if tokens.is_empty() {
            self.places.remove(condition);
        }
        Some(token)
    }

    pub fn clear(&mut self, condition: &str) -> Vec<TokenId> {
        self.places.remove(condition).unwrap_or_default()
    }

    pub fn drain_all(&mut self) -> Vec<TokenId> {
        std::mem::take(&mut self.places).into_values().flatten().collect()
    }

    /// Plain counts per marked condition, for snapshots and events.
    pub fn counts(&self) -> BTreeMap<ConditionId, usize> {
        self.marked().map(|(c, n)| (c.clone(), n)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Live,
    Consumed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub parent: Option<TokenId>,
    pub children: Vec<TokenId>,
    pub location: Option<ConditionId>,
    pub status: TokenStatus,
    pub data: Map<String, Value>,
}

/// Every token a runner ever created, linked by id into a lineage tree.
/// Entries are never removed so consumed tokens stay auditable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenArena {
    tokens: HashMap<TokenId, Token>,
}

impl TokenArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, parent: Option<TokenId>, location: &str, data: Map<String, Value>) -> TokenId {
        let id = Uuid::new_v4();
        if let Some(p) = parent.and_then(|p| self.tokens.get_mut(&p)) {
            p.children.push(id);
        }
        self.tokens.insert(
            id,
            Token {
                id,
                parent,
                children: Vec::new(),
                location: Some(location.to_string()),
                status: TokenStatus::Live,
                data,
            },
        );
        id
    }

    pub fn retire(&mut self, id: &TokenId, status: TokenStatus) {
        if let Some(t) = self.tokens.get_mut(id) {
            t.location = None;
            t.status = status;
        }
    }

    pub fn get(&self, id: &TokenId) -> Option<&Token> {
        self.tokens.get(id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn live(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values().filter(|t| t.status == TokenStatus::Live)
    }

    /// Walks parent links up to the root token.
    pub fn lineage(&self, id: &TokenId) -> Vec<TokenId> {
        let mut chain = Vec::new();
        let mut cursor = Some(*id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.tokens.get(&current).and_then(|t| t.parent);
        }
        chain
    }
}
