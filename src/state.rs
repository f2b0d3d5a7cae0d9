//! Bookkeeping of what is currently open in a result stream
//!
//! At most one run, one test and one module are open at a time. Tests and modules are tracked
//! independently of each other, only the run scopes tests. The state never rejects a transition,
//! it reports what it replaced so that the parser can close it properly.
//!

use crate::listener::TestDescription;
use crate::store::ModuleContext;

/// A run between `TEST_RUN_STARTED` and `TEST_RUN_ENDED`
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    /// Run name
    pub name: String,
    /// Number of tests the run announced
    pub test_count: usize,
    /// Retry attempt
    pub attempt: u32,
    /// Number of tests started so far
    pub tests_started: usize,
    /// Whether `test_run_failed` was reported
    pub failure_reported: bool,
}

impl RunState {
    /// Open run without started tests
    pub fn new<T: Into<String>>(name: T, test_count: usize, attempt: u32) -> Self {
        RunState {
            name: name.into(),
            test_count,
            attempt,
            tests_started: 0,
            failure_reported: false,
        }
    }
}

/// Currently open run, test and module
#[derive(Debug, Clone, Default)]
pub struct DispatchState {
    run: Option<RunState>,
    test: Option<TestDescription>,
    module: Option<ModuleContext>,
}

impl DispatchState {
    /// Open run
    pub fn run(&self) -> Option<&RunState> {
        self.run.as_ref()
    }

    /// Open test
    pub fn test(&self) -> Option<&TestDescription> {
        self.test.as_ref()
    }

    /// Open module
    pub fn module(&self) -> Option<&ModuleContext> {
        self.module.as_ref()
    }

    /// Open a run, returning the one it replaces
    pub fn open_run(&mut self, run: RunState) -> Option<RunState> {
        self.run.replace(run)
    }

    /// Close the current run
    ///
    /// A test still open at this point belongs to the run and is dropped as well.
    ///
    pub fn close_run(&mut self) -> Option<RunState> {
        self.test = None;
        self.run.take()
    }

    /// Remember that a failure was reported for the current run
    pub fn mark_run_failed(&mut self) {
        if let Some(run) = self.run.as_mut() {
            run.failure_reported = true;
        }
    }

    /// Open a test, returning the one it replaces
    pub fn open_test(&mut self, test: TestDescription) -> Option<TestDescription> {
        if let Some(run) = self.run.as_mut() {
            run.tests_started += 1;
        }
        self.test.replace(test)
    }

    /// Close the current test
    pub fn close_test(&mut self) -> Option<TestDescription> {
        self.test.take()
    }

    /// Open a module, returning the one it replaces
    pub fn open_module(&mut self, module: ModuleContext) -> Option<ModuleContext> {
        self.module.replace(module)
    }

    /// Close the current module
    pub fn close_module(&mut self) -> Option<ModuleContext> {
        self.module.take()
    }

    /// Whether nothing is open
    pub fn is_idle(&self) -> bool {
        self.run.is_none() && self.test.is_none() && self.module.is_none()
    }

    /// Forget everything
    pub fn reset(&mut self) {
        *self = DispatchState::default();
    }
}
