use std::process::Command;

use crate::error::{Result, ThinBackupError};

//------------------------------------------

/// The narrow seam between the core and the external `lvs`/`lvcreate`/
/// `lvrename`/`lvremove`/`dmsetup`/`thin_delta`/`thin_dump` binaries.
/// Production code shells out via [`SystemToolRunner`]; tests substitute an
/// in-memory stand-in, mirroring the `ChunkFetcher` mocking pattern used by
/// the aligner.
pub trait ToolRunner {
    /// Runs `program` with `args`, returning its captured stdout on success.
    fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>>;
}

/// Spawns `program`, captures stdout/stderr, and converts a non-zero exit
/// status into a [`ThinBackupError::ToolFailed`] carrying the program name,
/// arguments, exit code, and captured (truncated) stderr. This is the single
/// chokepoint every tool invocation in the production `ToolRunner` goes
/// through, matching the teacher's `commands::utils::to_exit_code` pattern of
/// centralising a status check rather than scattering it through call sites.
pub fn run_checked(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ThinBackupError::DeviceIOError {
            path: program.into(),
            offset: 0,
            source,
        })?;

    if !output.status.success() {
        const MAX_STDERR: usize = 4096;
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.len() > MAX_STDERR {
            stderr.truncate(MAX_STDERR);
            stderr.push_str(" [truncated]");
        }
        return Err(ThinBackupError::ToolFailed {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            code: output.status.code(),
            stderr,
        });
    }

    Ok(output.stdout)
}

/// Production [`ToolRunner`]: every call is a real child process.
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        run_checked(program, args)
    }
}

//------------------------------------------

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// An in-memory [`ToolRunner`] keyed on `(program, args)`, for unit tests
    /// that don't want to spawn real LVM/thin-provisioning-tools binaries.
    #[derive(Default)]
    pub struct FakeToolRunner {
        pub responses: HashMap<(String, Vec<String>), Result<Vec<u8>>>,
    }

    impl FakeToolRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn expect(&mut self, program: &str, args: &[&str], output: &[u8]) {
            self.responses.insert(
                (
                    program.to_string(),
                    args.iter().map(|s| s.to_string()).collect(),
                ),
                Ok(output.to_vec()),
            );
        }
    }

    impl ToolRunner for FakeToolRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
            let key = (
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            );
            match self.responses.get(&key) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(_)) => Err(ThinBackupError::ToolFailed {
                    program: program.to_string(),
                    args: args.iter().map(|s| s.to_string()).collect(),
                    code: Some(1),
                    stderr: "fake tool failure".to_string(),
                }),
                None => Err(ThinBackupError::ToolFailed {
                    program: program.to_string(),
                    args: args.iter().map(|s| s.to_string()).collect(),
                    code: None,
                    stderr: "no response configured for this invocation".to_string(),
                }),
            }
        }
    }
}

//------------------------------------------
