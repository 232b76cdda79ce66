//! Wire protocol between a process pool and its worker processes.
//!
//! Frames are length-prefixed bincode: a little-endian `u32` byte count
//! followed by the encoded value. Orders flow parent → child over the
//! worker's stdin; replies flow child → parent over its stdout.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::ErrorReport;
use crate::future::TaskId;

/// Upper bound on a single frame, guarding against corrupted prefixes.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Parent → child: run a task or exit cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WorkerOrder {
    Run {
        task_id: TaskId,
        kind: String,
        payload: Vec<u8>,
    },
    Exit,
}

/// Which stage of the worker lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FailureStage {
    Initializer,
    Finalizer,
    Loop,
}

/// Child → parent: task lifecycle and worker farewell messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WorkerReply {
    Running {
        task_id: TaskId,
    },
    Completed {
        task_id: TaskId,
        payload: Vec<u8>,
    },
    TaskFailed {
        task_id: TaskId,
        report: ErrorReport,
    },
    WorkerFailed {
        stage: FailureStage,
        report: ErrorReport,
    },
    Shutdown,
}

/// Write one frame and flush it.
pub(crate) fn write_frame<T: Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    let bytes = bincode::serialize(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream (EOF at a
/// frame boundary); any other truncation or decode failure is an error.
pub(crate) fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> io::Result<Option<T>> {
    let mut prefix = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut prefix) {
        return if err.kind() == io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(err)
        };
    }
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame length exceeds limit",
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    bincode::deserialize(&payload)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}
