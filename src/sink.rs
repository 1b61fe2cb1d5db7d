//! Process-wide reporting of faults raised by user machine code.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Error type returned by user state methods and command handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Which activity a fault interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Run,
    Command,
    Terminate,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => f.write_str("run"),
            Self::Command => f.write_str("command"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

/// A failure inside user code.
#[derive(Debug, thiserror::Error)]
pub enum MachineFault {
    #[error("returned an error: {0}")]
    Failed(#[source] BoxError),

    #[error("panicked: {0}")]
    Panicked(String),
}

impl MachineFault {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

/// A fault together with the machine it happened in.
#[derive(Debug, thiserror::Error)]
#[error("{machine}#{serial} [{identifier}] {activity} {error}")]
pub struct Fault {
    pub machine: &'static str,
    pub serial: u64,
    pub identifier: String,
    pub activity: Activity,
    #[source]
    pub error: MachineFault,
}

/// What happens to a machine after one of its activities faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Report, then terminate the machine.
    #[default]
    Terminate,
    /// Report and keep the machine scheduled.
    Continue,
}

/// Replaceable callback invoked for every [`Fault`].
///
/// The sink is called from worker tasks, never from the scheduler tick.
#[derive(Clone)]
pub struct ExceptionSink {
    report: Arc<dyn Fn(&Fault) + Send + Sync>,
}

impl ExceptionSink {
    pub fn new<F>(report: F) -> Self
    where
        F: Fn(&Fault) + Send + Sync + 'static,
    {
        Self {
            report: Arc::new(report),
        }
    }

    /// Logs every fault at `error` level.
    pub fn log() -> Self {
        Self::new(|fault| {
            tracing::error!(
                machine = fault.machine,
                serial = fault.serial,
                identifier = %fault.identifier,
                activity = %fault.activity,
                error = %fault.error,
                "unhandled machine fault"
            );
        })
    }

    /// Re-raises every fault as a panic on the worker task that observed it.
    ///
    /// The panic resumes after the faulting machine released its lock and,
    /// when the fault terminated it, after its teardown. The tick loop never
    /// runs user code and keeps going.
    pub fn escalate() -> Self {
        Self::new(|fault| panic!("unhandled machine fault: {fault}"))
    }

    pub fn report(&self, fault: &Fault) {
        (self.report)(fault)
    }
}

/// Faults are fatal to the worker that observed them unless a sink says
/// otherwise.
impl Default for ExceptionSink {
    fn default() -> Self {
        Self::escalate()
    }
}

impl fmt::Debug for ExceptionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionSink").finish_non_exhaustive()
    }
}
