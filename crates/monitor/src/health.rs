use types::{ErrorKind, LinkHealth};

/// Tracks link availability from poll outcomes.
///
/// One failure while online only degrades to `Uncertain`; a second
/// consecutive failure is needed to go `Offline`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkHealthMachine {
    state: LinkHealth,
}

impl LinkHealthMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkHealth {
        self.state
    }

    pub fn is_available(&self) -> bool {
        self.state.is_available()
    }

    pub fn update(&mut self, outcome: ErrorKind) -> LinkHealth {
        self.state = match (self.state, outcome.is_success()) {
            (_, true) => LinkHealth::Online,
            (LinkHealth::Online, false) => LinkHealth::Uncertain,
            (LinkHealth::Uncertain | LinkHealth::Offline, false) => LinkHealth::Offline,
        };
        self.state
    }
}
