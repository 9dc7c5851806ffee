use crate::net_protocol::queue::ResultsSummary;

/// Exit code of a dtq process that failed itself, as opposed to the tests it ran.
pub const CODE_ERROR: i32 = 101;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    /// Some tests failed or were lost.
    pub const FAILURE: ExitCode = ExitCode(1);
    pub const DTQ_ERROR: ExitCode = ExitCode(CODE_ERROR);

    /// The exit code of a submitter that waited for a job with these results.
    pub fn for_results(summary: &ResultsSummary) -> Self {
        if summary.is_success() {
            Self::SUCCESS
        } else {
            Self::FAILURE
        }
    }

    pub const fn get(&self) -> i32 {
        self.0
    }
}
