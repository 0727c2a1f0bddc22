// ODB - Origin Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Recorder orchestration: configuration and per-VM session management.
//!
//! A [`Recorder`] holds the recording configuration and a registry of guest
//! VMs that currently have a session attached. Starting a session installs an
//! [`InstrumentedEvaluator`] as the VM's dispatch hook; tearing it down (via
//! [`RecordSession::finish`] or drop) releases the VM for a later session.
//! Exactly one session may be attached to a VM at a time.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use eyre::Result;
use odb_common::env::{RECORDER_CALLBACK_AT, TRACE_DIR};
use odb_common::hook::{RecordHook, StepContext, StepOutcome};
use odb_common::types::{AbortReason, CodeInfo};
use tracing::info;

use crate::error::RecordError;
use crate::recorder::{CancelHandle, InstrumentedEvaluator, StepCallback};
use crate::trace::{ForkPolicy, TraceWriter};

/// Configuration for the recording engine.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Directory trace files are created in
    pub trace_dir: PathBuf,
    /// Initial stepping-callback threshold; `0` disables the callback
    pub callback_at: u64,
    /// What to do when the recording process forks
    pub fork_policy: ForkPolicy,
    /// Per-thread buffer size that triggers a segment flush
    pub flush_threshold: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let trace_dir = std::env::var_os(TRACE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("odb-traces"));
        let callback_at = std::env::var(RECORDER_CALLBACK_AT)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        Self {
            trace_dir,
            callback_at,
            fork_policy: ForkPolicy::default(),
            flush_threshold: TraceWriter::DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl RecorderConfig {
    /// Set the trace output directory.
    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = dir.into();
        self
    }

    /// Set the initial stepping-callback threshold.
    pub fn with_callback_at(mut self, callback_at: u64) -> Self {
        self.callback_at = callback_at;
        self
    }

    /// Set the fork policy.
    pub fn with_fork_policy(mut self, policy: ForkPolicy) -> Self {
        self.fork_policy = policy;
        self
    }

    /// Set the flush threshold in bytes.
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }
}

/// The recording engine: configuration plus the per-VM session registry.
#[derive(Debug, Default)]
pub struct Recorder {
    config: RecorderConfig,
    installed: Arc<DashMap<u64, ()>>,
}

impl Recorder {
    /// Create a recorder with the given configuration.
    pub fn new(config: RecorderConfig) -> Self {
        Self { config, installed: Arc::new(DashMap::new()) }
    }

    /// The active configuration.
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Whether a session is currently attached to `vm_id`.
    pub fn is_installed(&self, vm_id: u64) -> bool {
        self.installed.contains_key(&vm_id)
    }

    /// Attach a recording session to the VM identified by `vm_id`, creating
    /// `<trace_dir>/<trace_name>.rtrc`.
    pub fn start_session(
        &self,
        vm_id: u64,
        trace_name: &str,
    ) -> Result<RecordSession, RecordError> {
        if self.installed.insert(vm_id, ()).is_some() {
            return Err(RecordError::AlreadyInstalled(vm_id));
        }

        let path = self.config.trace_dir.join(format!("{trace_name}.rtrc"));
        let writer = match TraceWriter::create(
            &path,
            self.config.fork_policy,
            self.config.flush_threshold,
        ) {
            Ok(writer) => writer,
            Err(e) => {
                self.installed.remove(&vm_id);
                return Err(e);
            }
        };
        let evaluator = InstrumentedEvaluator::new(writer, self.config.callback_at);

        info!(vm_id, trace = %path.display(), "recording session started");
        Ok(RecordSession {
            vm_id,
            evaluator: Some(evaluator),
            installed: self.installed.clone(),
        })
    }
}

/// One live recording session, installed as a guest VM's dispatch hook.
///
/// The session owns the trace writer; dropping it without calling
/// [`RecordSession::finish`] releases the VM registration but leaves the
/// trace unfinalized.
pub struct RecordSession {
    vm_id: u64,
    evaluator: Option<InstrumentedEvaluator<TraceWriter>>,
    installed: Arc<DashMap<u64, ()>>,
}

impl RecordSession {
    /// Install the stepping callback.
    pub fn set_callback(&mut self, callback: StepCallback) {
        self.evaluator().set_callback(callback);
    }

    /// Handle for cancelling this session from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.evaluator.as_ref().expect("live until finish").cancel_handle()
    }

    /// Why the session aborted, if it did.
    pub fn aborted(&self) -> Option<AbortReason> {
        self.evaluator.as_ref().expect("live until finish").aborted()
    }

    /// Finalize the trace file and detach from the VM.
    pub fn finish(mut self) -> Result<PathBuf, RecordError> {
        let evaluator = self.evaluator.take().expect("finish is called at most once");
        let path = evaluator.into_sink().finish()?;
        info!(vm_id = self.vm_id, trace = %path.display(), "recording session finished");
        Ok(path)
    }

    fn evaluator(&mut self) -> &mut InstrumentedEvaluator<TraceWriter> {
        self.evaluator.as_mut().expect("live until finish")
    }
}

impl RecordHook for RecordSession {
    fn code_loaded(&mut self, code: &CodeInfo) -> Result<()> {
        self.evaluator().code_loaded(code)
    }

    fn frame_enter(&mut self, thread_id: u16, code_id: u32) -> Result<()> {
        self.evaluator().frame_enter(thread_id, code_id)
    }

    fn step(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        self.evaluator().step(ctx)
    }

    fn step_end(&mut self, ctx: &StepContext<'_>, outcome: &StepOutcome) -> Result<()> {
        self.evaluator().step_end(ctx, outcome)
    }

    fn frame_unwound(&mut self, thread_id: u16) -> Result<()> {
        self.evaluator().frame_unwound(thread_id)
    }
}

impl Drop for RecordSession {
    fn drop(&mut self) {
        self.installed.remove(&self.vm_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_common::logging;

    #[test]
    fn test_default_config() {
        logging::ensure_test_logging(None);
        let config = RecorderConfig::default();
        assert_eq!(config.fork_policy, ForkPolicy::Refuse);
        assert_eq!(config.flush_threshold, TraceWriter::DEFAULT_FLUSH_THRESHOLD);
    }

    #[test]
    fn test_config_builders() {
        logging::ensure_test_logging(None);
        let config = RecorderConfig::default()
            .with_trace_dir("/tmp/somewhere")
            .with_callback_at(0)
            .with_fork_policy(ForkPolicy::NewFile)
            .with_flush_threshold(1024);
        assert_eq!(config.trace_dir, PathBuf::from("/tmp/somewhere"));
        assert_eq!(config.callback_at, 0);
        assert_eq!(config.fork_policy, ForkPolicy::NewFile);
        assert_eq!(config.flush_threshold, 1024);
    }

    #[test]
    fn test_single_session_per_vm() {
        logging::ensure_test_logging(None);
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(RecorderConfig::default().with_trace_dir(dir.path()));

        let session = recorder.start_session(7, "first").unwrap();
        assert!(recorder.is_installed(7));
        assert!(matches!(
            recorder.start_session(7, "second"),
            Err(RecordError::AlreadyInstalled(7))
        ));

        session.finish().unwrap();
        assert!(!recorder.is_installed(7));

        // The VM is free again
        let session = recorder.start_session(7, "third").unwrap();
        session.finish().unwrap();
    }
}
