//! Interception pipeline
//!
//! Decides, per GATT operation, whether it goes straight through, goes through a
//! transform hook, or waits for the operator. Only one operation is in front of the
//! operator at a time; the others queue up and are surfaced one by one as each edit is
//! resolved.

use crate::gatt::normalize;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Forward,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Idling,
    Editing,
}

/// Order in which queued edits reach the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOrder {
    /// Arrival order.
    #[default]
    Fifo,
    /// Most recent first.
    Lifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Notify,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Notify => "notify",
        })
    }
}

/// Transform applied to the payload of matching operations.
pub type Transform = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
pub enum Hook {
    Transform(Transform),
    /// Every matching operation waits for the operator.
    Manual,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transform(_) => f.write_str("Transform(..)"),
            Self::Manual => f.write_str("Manual"),
        }
    }
}

/// An operation travelling through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub operation: Operation,
    pub service: String,
    pub characteristic: String,
    pub data: Vec<u8>,
    pub offset: Option<u16>,
    pub without_response: Option<bool>,
    /// Pipeline mode when the operation was suspended.
    pub mode: Mode,
}

impl PendingEdit {
    pub fn read(service: &str, characteristic: &str, data: Vec<u8>, offset: u16) -> Self {
        Self::new(Operation::Read, service, characteristic, data, Some(offset), None)
    }

    pub fn write(
        service: &str,
        characteristic: &str,
        data: Vec<u8>,
        offset: u16,
        without_response: bool,
    ) -> Self {
        Self::new(
            Operation::Write,
            service,
            characteristic,
            data,
            Some(offset),
            Some(without_response),
        )
    }

    pub fn notify(service: &str, characteristic: &str, data: Vec<u8>) -> Self {
        Self::new(Operation::Notify, service, characteristic, data, None, None)
    }

    fn new(
        operation: Operation,
        service: &str,
        characteristic: &str,
        data: Vec<u8>,
        offset: Option<u16>,
        without_response: Option<bool>,
    ) -> Self {
        Self {
            operation,
            service: normalize(service),
            characteristic: normalize(characteristic),
            data,
            offset,
            without_response,
            mode: Mode::Forward,
        }
    }
}

/// What to do with a submitted operation right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Send to the opposite side, payload possibly transformed.
    Forward(PendingEdit),
    /// Show to the operator; nothing is forwarded until it is resolved.
    Surface(PendingEdit),
    /// Another edit is in progress; this one waits its turn.
    Queued,
}

/// Operator decision on the surfaced edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Forward(Vec<u8>),
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// The edited operation to forward, `None` when discarded.
    pub forward: Option<PendingEdit>,
    /// The discarded operation, so the caller can fail it towards its originator.
    pub discarded: Option<PendingEdit>,
    /// Next edit surfaced to the operator, if any was queued.
    pub next: Option<PendingEdit>,
}

#[derive(Debug)]
pub struct InterceptionPipeline {
    mode: Mode,
    edit_state: EditState,
    order: EditOrder,
    hooks: HashMap<(String, String), Hook>,
    current: Option<PendingEdit>,
    pending: VecDeque<PendingEdit>,
}

impl Default for InterceptionPipeline {
    fn default() -> Self {
        Self::new(EditOrder::default())
    }
}

impl InterceptionPipeline {
    pub fn new(order: EditOrder) -> Self {
        Self {
            mode: Mode::Forward,
            edit_state: EditState::Idling,
            order,
            hooks: HashMap::new(),
            current: None,
            pending: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Applies to operations arriving from now on; queued edits keep their mode.
    pub fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            info!("Interception mode: {:?}", mode);
        }
        self.mode = mode;
    }

    pub fn edit_state(&self) -> EditState {
        self.edit_state
    }

    pub fn current(&self) -> Option<&PendingEdit> {
        self.current.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn set_hook(&mut self, service: &str, characteristic: &str, hook: Hook) {
        let key = (normalize(service), normalize(characteristic));
        debug!("Hook on {} {}: {:?}", key.0, key.1, hook);
        self.hooks.insert(key, hook);
    }

    pub fn remove_hook(&mut self, service: &str, characteristic: &str) -> Option<Hook> {
        self.hooks
            .remove(&(normalize(service), normalize(characteristic)))
    }

    pub fn submit(&mut self, mut edit: PendingEdit) -> Verdict {
        let key = (edit.service.clone(), edit.characteristic.clone());

        match (self.hooks.get(&key), self.mode) {
            (Some(Hook::Transform(transform)), _) => {
                edit.data = transform(&edit.data);
                return Verdict::Forward(edit);
            }
            (None, Mode::Forward) => return Verdict::Forward(edit),
            _ => {}
        }

        edit.mode = self.mode;
        match self.edit_state {
            EditState::Editing => {
                debug!(
                    "Queueing {} on {} {} ({} pending)",
                    edit.operation,
                    edit.service,
                    edit.characteristic,
                    self.pending.len() + 1
                );
                self.pending.push_back(edit);
                Verdict::Queued
            }
            EditState::Idling => {
                self.edit_state = EditState::Editing;
                self.current = Some(edit.clone());
                Verdict::Surface(edit)
            }
        }
    }

    /// Resolves the surfaced edit and moves on to the next queued one.
    ///
    /// Returns `None` when nothing is being edited.
    pub fn resolve(&mut self, resolution: Resolution) -> Option<Resolved> {
        let mut edit = self.current.take()?;
        let (forward, discarded) = match resolution {
            Resolution::Forward(data) => {
                edit.data = data;
                (Some(edit), None)
            }
            Resolution::Discard => {
                debug!("Discarding {} on {} {}", edit.operation, edit.service, edit.characteristic);
                (None, Some(edit))
            }
        };
        let next = self.process_next();
        Some(Resolved {
            forward,
            discarded,
            next,
        })
    }

    fn process_next(&mut self) -> Option<PendingEdit> {
        let next = match self.order {
            EditOrder::Fifo => self.pending.pop_front(),
            EditOrder::Lifo => self.pending.pop_back(),
        };
        match next {
            Some(edit) => {
                self.current = Some(edit.clone());
                Some(edit)
            }
            None => {
                self.edit_state = EditState::Idling;
                None
            }
        }
    }

    /// Drops every suspended operation, returning them so they can be failed.
    pub fn clear(&mut self) -> Vec<PendingEdit> {
        self.edit_state = EditState::Idling;
        self.current.take().into_iter().chain(self.pending.drain(..)).collect()
    }
}
