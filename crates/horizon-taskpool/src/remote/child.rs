//! The worker-process side of a process pool.
//!
//! A worker child is a dumb frame loop: it reads orders from stdin,
//! publishes a `Running` reply before executing each task, publishes the
//! outcome after, and says farewell (`Shutdown` or `WorkerFailed`) before
//! exiting. Idle timeouts and task budgets are enforced by the parent-side
//! feeder, which closes the stream when the worker should retire.

use std::backtrace::Backtrace;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process;

use parking_lot::Mutex;

use crate::error::ErrorReport;
use crate::remote::TaskRegistry;
use crate::remote::protocol::{self, FailureStage, WorkerOrder, WorkerReply};
use crate::worker::WorkerHook;

/// Backtrace captured by the panic hook at the actual panic site, taken by
/// whichever guard catches the unwind.
static PANIC_TRACE: Mutex<Option<String>> = Mutex::new(None);

pub(crate) fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.lock().take()
}

/// Run the worker loop over stdin/stdout and exit the process.
pub(crate) fn run_child(registry: &TaskRegistry) -> ! {
    // Capture backtraces where panics happen and keep panic chatter off
    // the inherited stderr.
    panic::set_hook(Box::new(|_info| {
        *PANIC_TRACE.lock() = Some(Backtrace::force_capture().to_string());
    }));

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = io::BufReader::new(stdin.lock());
    let mut output = io::BufWriter::new(stdout.lock());
    let farewell = match serve(registry, &mut input, &mut output) {
        Ok(()) => WorkerReply::Shutdown,
        Err((stage, report)) => WorkerReply::WorkerFailed { stage, report },
    };
    let _ = protocol::write_frame(&mut output, &farewell);
    let _ = output.flush();
    process::exit(0);
}

fn serve(
    registry: &TaskRegistry,
    input: &mut impl Read,
    output: &mut impl Write,
) -> Result<(), (FailureStage, ErrorReport)> {
    if let Some(initializer) = registry.initializer() {
        run_hook(initializer).map_err(|report| (FailureStage::Initializer, report))?;
    }
    loop {
        match protocol::read_frame::<WorkerOrder>(input) {
            Ok(Some(WorkerOrder::Run {
                task_id,
                kind,
                payload,
            })) => {
                protocol::write_frame(output, &WorkerReply::Running { task_id })
                    .map_err(loop_failure)?;
                let reply = match registry.run_handler(&kind, &payload) {
                    Ok(payload) => WorkerReply::Completed { task_id, payload },
                    Err(report) => WorkerReply::TaskFailed { task_id, report },
                };
                protocol::write_frame(output, &reply).map_err(loop_failure)?;
            }
            Ok(Some(WorkerOrder::Exit)) | Ok(None) => break,
            Err(err) => {
                return Err((
                    FailureStage::Loop,
                    ErrorReport::new(format!("failed to read task frame: {err}")),
                ));
            }
        }
    }
    if let Some(finalizer) = registry.finalizer() {
        run_hook(finalizer).map_err(|report| (FailureStage::Finalizer, report))?;
    }
    Ok(())
}

fn loop_failure(err: io::Error) -> (FailureStage, ErrorReport) {
    (
        FailureStage::Loop,
        ErrorReport::new(format!("failed to write reply frame: {err}")),
    )
}

fn run_hook(hook: &WorkerHook) -> Result<(), ErrorReport> {
    match panic::catch_unwind(AssertUnwindSafe(|| (**hook)())) {
        Ok(()) => Ok(()),
        Err(payload) => {
            let report = ErrorReport::from_panic(payload);
            Err(match take_panic_trace() {
                Some(trace) => report.with_trace(trace),
                None => report,
            })
        }
    }
}
