use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::chat::message::{Idx, Message};
use crate::chat::storage::{HistoryBounds, Storage};
use crate::util::id::Id;

#[derive(Default)]
struct State {
    history: BTreeMap<Idx, Message>,
    sending: Vec<Message>,
    bounds: Option<HistoryBounds>,
}

/// A [`Storage`] in memory. Clones share their state, so a test can keep a handle to the store
///  it passed to a buffer.
#[derive(Clone)]
pub struct MemoryStorage {
    user_id: Id,
    state: Rc<RefCell<State>>,
}

impl MemoryStorage {
    pub fn new(user_id: Id) -> MemoryStorage {
        MemoryStorage {
            user_id,
            state: Default::default(),
        }
    }

    pub fn add_history(&self, idx: Idx, msg: Message) {
        self.state.borrow_mut().history.insert(idx, msg);
    }

    pub fn add_sending(&self, msg: Message) {
        self.state.borrow_mut().sending.push(msg);
    }

    /// overrides the bounds derived from the stored history
    pub fn set_bounds(&self, bounds: HistoryBounds) {
        self.state.borrow_mut().bounds = Some(bounds);
    }

    pub fn sending_ids(&self) -> Vec<Id> {
        self.state.borrow().sending.iter().map(|m| m.id).collect()
    }

    /// ids of the stored history, oldest first
    pub fn history_ids(&self) -> Vec<Id> {
        self.state.borrow().history.values().map(|m| m.id).collect()
    }
}

impl Storage for MemoryStorage {
    fn history_bounds(&self) -> anyhow::Result<Option<HistoryBounds>> {
        let state = self.state.borrow();
        if state.bounds.is_some() {
            return Ok(state.bounds);
        }
        let (Some((_, oldest)), Some((&newest_idx, newest))) = (state.history.first_key_value(), state.history.last_key_value()) else {
            return Ok(None);
        };
        Ok(Some(HistoryBounds {
            oldest: oldest.id,
            newest: newest.id,
            newest_idx,
        }))
    }

    fn fetch_range(&mut self, start_idx: Idx, count: u32) -> anyhow::Result<Vec<Message>> {
        Ok(self.state.borrow().history
            .range(..=start_idx)
            .rev()
            .take(count as usize)
            .map(|(_, msg)| msg.clone())
            .collect())
    }

    fn persist_sending(&mut self, msg: &Message) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        match state.sending.iter_mut().find(|m| m.id == msg.id) {
            Some(existing) => *existing = msg.clone(),
            None => state.sending.push(msg.clone()),
        }
        Ok(())
    }

    fn remove_sending(&mut self, xid: Id) -> anyhow::Result<()> {
        self.state.borrow_mut().sending.retain(|m| m.id != xid);
        Ok(())
    }

    fn update_sending_edit_id(&mut self, xid: Id, msg_id: Id) -> anyhow::Result<()> {
        if let Some(msg) = self.state.borrow_mut().sending.iter_mut().find(|m| m.id == xid) {
            msg.set_edits(msg_id, false);
        }
        Ok(())
    }

    fn load_sending_queue(&mut self) -> anyhow::Result<Vec<Message>> {
        Ok(self.state.borrow().sending.clone())
    }

    fn append_to_history(&mut self, idx: Idx, msg: &Message) -> anyhow::Result<()> {
        self.state.borrow_mut().history.insert(idx, msg.clone());
        Ok(())
    }

    fn index_of_id(&self, id: Id) -> anyhow::Result<Option<Idx>> {
        Ok(self.state.borrow().history.iter()
            .find(|(_, msg)| msg.id == id)
            .map(|(idx, _)| *idx))
    }

    fn peer_msg_count_after_idx(&self, after_idx: Idx, below_idx: Idx) -> anyhow::Result<u32> {
        if after_idx + 1 >= below_idx {
            return Ok(0);
        }
        Ok(self.state.borrow().history
            .range(after_idx + 1..below_idx)
            .filter(|(_, msg)| msg.user_id != self.user_id)
            .count() as u32)
    }
}
