//! Lifecycle events and their handler slots.

use std::fmt;

use super::channel::Channel;

/// Points in a worker's life where a subscriber may act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeEvent {
    /// First block acknowledged.
    FirstPacket,
    /// Once, before the remaining blocks are written.
    BeforeWrite,
    /// Once, after the last block.
    AfterWrite,
    /// Worker reached `Done`.
    Finish,
    /// Worker entered `Error`.
    Error,
    /// After every acknowledged block.
    Progress,
}

impl UpgradeEvent {
    const COUNT: usize = 6;

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for UpgradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradeEvent::FirstPacket => "first_packet",
            UpgradeEvent::BeforeWrite => "before_write",
            UpgradeEvent::AfterWrite => "after_write",
            UpgradeEvent::Finish => "finish",
            UpgradeEvent::Error => "error",
            UpgradeEvent::Progress => "progress",
        };
        f.write_str(name)
    }
}

/// What a handler gets to see.
pub struct HookContext<'a> {
    pub worker: &'a str,
    /// Bytes the worker will write in total.
    pub total: usize,
    /// Bytes acknowledged so far.
    pub current: usize,
    /// Set for `Error`.
    pub cause: Option<&'a str>,
    pub channel: &'a dyn Channel,
}

pub type Hook = Box<dyn Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// One optional handler per event.
#[derive(Default)]
pub struct Hooks {
    slots: [Option<Hook>; UpgradeEvent::COUNT],
}

impl Hooks {
    /// Register `hook` for `event`, replacing any earlier one.
    pub fn on(&mut self, event: UpgradeEvent, hook: Hook) {
        self.slots[event.slot()] = Some(hook);
    }

    pub fn has(&self, event: UpgradeEvent) -> bool {
        self.slots[event.slot()].is_some()
    }

    pub(crate) fn fire(&self, event: UpgradeEvent, ctx: &HookContext<'_>) -> anyhow::Result<()> {
        match &self.slots[event.slot()] {
            Some(hook) => hook(ctx),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<_> = [
            UpgradeEvent::FirstPacket,
            UpgradeEvent::BeforeWrite,
            UpgradeEvent::AfterWrite,
            UpgradeEvent::Finish,
            UpgradeEvent::Error,
            UpgradeEvent::Progress,
        ]
        .into_iter()
        .filter(|e| self.has(*e))
        .collect();
        f.debug_struct("Hooks").field("registered", &registered).finish()
    }
}
