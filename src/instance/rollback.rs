use std::fmt;

/// An action that undoes a lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Power the VM down and drop the session lock
    Shutdown,
    /// Detach storage, unregister and delete the machine
    Destroy,
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compensation::Shutdown => "shutdown",
            Compensation::Destroy => "destroy",
        })
    }
}

/// Compensating actions pushed as stages start, run newest first on failure
#[derive(Debug, Default)]
pub struct Rollback {
    actions: Vec<Compensation>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    #[cfg(test)]
    fn pending(&self) -> &[Compensation] {
        &self.actions
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Consume the stack in unwind order
    pub fn unwind(self) -> impl Iterator<Item = Compensation> {
        self.actions.into_iter().rev()
    }
}
