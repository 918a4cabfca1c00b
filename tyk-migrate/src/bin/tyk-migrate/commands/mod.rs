pub mod run;
pub mod scan;

/// How a command that did not fail outright finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    /// The run completed but some records were not migrated
    RecordFailures,
}

impl CommandStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            CommandStatus::Success => 0,
            CommandStatus::RecordFailures => 2,
        }
    }
}
