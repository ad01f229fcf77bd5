//! Scoped cleanup actions.
//!
//! A [`Cleanup`] collects deferred actions (typically temp-file
//! removals) and runs them exactly once when dropped, covering every
//! exit path of the scope that owns it. Call [`Cleanup::discard`] to
//! hand responsibility over once a step completes successfully.

pub struct Cleanup {
    actions: Vec<Box<dyn FnOnce() + Send>>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Registers an action to run on drop, after previously added ones.
    pub fn add(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Drops all registered actions without running them.
    pub fn discard(&mut self) {
        self.actions.clear();
    }

    /// Runs all registered actions now; drop becomes a no-op.
    pub fn run(&mut self) {
        for action in self.actions.drain(..) {
            action();
        }
    }
}

impl Default for Cleanup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.run();
    }
}
