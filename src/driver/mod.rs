//! The command-line front-end: owns the configuration and the input tree
//! while arguments stream in, then hands both to the engine.

mod cli;

use crate::config::Config;
use crate::error::LinkError;
use crate::input::InputTreeBuilder;
use crate::linker::{self, LinkOutcome};
use crate::target::arm;

pub struct Driver {
    pub config: Config,
    pub builder: InputTreeBuilder,
    pub(crate) inputs_seen: bool,
}

impl Driver {
    pub fn new() -> Driver {
        Driver {
            config: Config::new("a.out"),
            builder: InputTreeBuilder::new(),
            inputs_seen: false,
        }
    }

    pub fn has_inputs(&self) -> bool {
        self.inputs_seen
    }

    /// Run the link with everything parsed so far.
    pub fn run(self) -> Result<LinkOutcome, LinkError> {
        let backend = arm::backend();
        linker::link(&self.config, &backend, self.builder)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Driver::new()
    }
}
